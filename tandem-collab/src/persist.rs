//! Storage and identity seams.
//!
//! The session loads and saves documents through [`DocumentPersistence`]
//! and resolves who is editing through [`IdentityProvider`]. Both are
//! traits so the host application decides where documents live and how
//! users authenticate; [`MemoryPersistence`] and [`FixedIdentity`] cover
//! servers, tests, and single-user setups.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::Participant;

/// A document as the storage layer knows it: the full content plus the
/// revision counter the next session resumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedDocument {
    pub content: String,
    pub revision: u64,
}

#[derive(Debug)]
pub enum PersistError {
    /// No stored document under this file id.
    NotFound(Uuid),
    /// The backing store failed.
    Backend(String),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::NotFound(file_id) => write!(f, "no document stored for {file_id}"),
            PersistError::Backend(msg) => write!(f, "storage backend error: {msg}"),
        }
    }
}

impl std::error::Error for PersistError {}

/// Where documents live between sessions.
#[async_trait]
pub trait DocumentPersistence: Send + Sync {
    async fn load_document(&self, file_id: Uuid) -> Result<PersistedDocument, PersistError>;

    async fn save_document(
        &self,
        file_id: Uuid,
        content: &str,
        revision: u64,
    ) -> Result<(), PersistError>;
}

/// In-memory store. The default for tests and for servers that treat
/// the room itself as the source of truth.
#[derive(Default)]
pub struct MemoryPersistence {
    documents: RwLock<HashMap<Uuid, PersistedDocument>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style seeding for tests.
    pub fn with_document(
        mut self,
        file_id: Uuid,
        content: impl Into<String>,
        revision: u64,
    ) -> Self {
        self.documents.get_mut().insert(
            file_id,
            PersistedDocument {
                content: content.into(),
                revision,
            },
        );
        self
    }
}

#[async_trait]
impl DocumentPersistence for MemoryPersistence {
    async fn load_document(&self, file_id: Uuid) -> Result<PersistedDocument, PersistError> {
        let documents = self.documents.read().await;
        documents
            .get(&file_id)
            .cloned()
            .ok_or(PersistError::NotFound(file_id))
    }

    async fn save_document(
        &self,
        file_id: Uuid,
        content: &str,
        revision: u64,
    ) -> Result<(), PersistError> {
        let mut documents = self.documents.write().await;
        documents.insert(
            file_id,
            PersistedDocument {
                content: content.to_string(),
                revision,
            },
        );
        Ok(())
    }
}

/// Who is editing.
pub trait IdentityProvider {
    fn identity(&self) -> Participant;
}

/// A fixed identity, resolved once at construction.
#[derive(Debug, Clone)]
pub struct FixedIdentity {
    participant: Participant,
}

impl FixedIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            participant: Participant::new(name),
        }
    }

    /// Keep a stable user id across sessions.
    pub fn with_id(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            participant: Participant::with_id(user_id, name),
        }
    }
}

impl IdentityProvider for FixedIdentity {
    fn identity(&self) -> Participant {
        self.participant.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryPersistence::new();
        let file_id = Uuid::new_v4();

        store.save_document(file_id, "hello", 3).await.unwrap();
        let doc = store.load_document(file_id).await.unwrap();

        assert_eq!(doc.content, "hello");
        assert_eq!(doc.revision, 3);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let store = MemoryPersistence::new();
        let file_id = Uuid::new_v4();

        match store.load_document(file_id).await {
            Err(PersistError::NotFound(id)) => assert_eq!(id, file_id),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = MemoryPersistence::new();
        let file_id = Uuid::new_v4();

        store.save_document(file_id, "v1", 1).await.unwrap();
        store.save_document(file_id, "v2", 5).await.unwrap();

        let doc = store.load_document(file_id).await.unwrap();
        assert_eq!(doc.content, "v2");
        assert_eq!(doc.revision, 5);
    }

    #[test]
    fn test_with_document_seeds_store() {
        let file_id = Uuid::new_v4();
        let store = MemoryPersistence::new().with_document(file_id, "seeded", 7);

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let doc = rt.block_on(store.load_document(file_id)).unwrap();
        assert_eq!(doc.content, "seeded");
        assert_eq!(doc.revision, 7);
    }

    #[test]
    fn test_fixed_identity_is_stable() {
        let provider = FixedIdentity::new("Ada");
        let first = provider.identity();
        let second = provider.identity();

        assert_eq!(first.user_id, second.user_id);
        assert_eq!(first.name, "Ada");
    }

    #[test]
    fn test_fixed_identity_with_id() {
        let user_id = Uuid::new_v4();
        let provider = FixedIdentity::with_id(user_id, "Grace");
        assert_eq!(provider.identity().user_id, user_id);
    }
}

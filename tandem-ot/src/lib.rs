//! # tandem-ot: operational transformation core for Tandem
//!
//! The pure, synchronous heart of collaborative text editing: character
//! operations, the pairwise transform that reconciles concurrent edits,
//! and the per-document session queue that tracks optimistic local edits
//! until the coordinating server acknowledges them.
//!
//! ## Architecture
//!
//! ```text
//! local edit                          remote operation
//!     │                                      │
//!     ▼                                      ▼
//! DocumentSession::submit_insert()   DocumentSession::receive_remote()
//!     │  (optimistic apply + pend)       │  (transform vs pending)
//!     ▼                                  ▼
//!           apply(buffer, op) ── one revision per operation
//! ```
//!
//! No I/O and no async anywhere in this crate. The networked layer
//! (tandem-collab) drives these types from its event loop.
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | transform pair | <100ns |
//! | apply 1KB insert into 64KB buffer | <50µs |
//! | receive with 10 pending | <2µs |
//!
//! Reference: Ellis & Gibbs (1989), Concurrency Control in Groupware Systems
//! Reference: Kleppmann, Chapter 5 (Replication)

pub mod operation;
pub mod session;
pub mod transform;

pub use operation::{apply, Operation, OpKind};
pub use session::DocumentSession;
pub use transform::transform;

//! Pairwise transformation of concurrent operations.
//!
//! Given two operations issued against the same buffer state, [`transform`]
//! rewrites their indexes so that each can be applied after the other:
//!
//! ```text
//!        base
//!       /    \
//!      a      b
//!      |      |
//!      b'     a'        apply(apply(base, a), b') == apply(apply(base, b), a')
//!       \    /
//!        same
//! ```
//!
//! The function is pure and never fails. Index arithmetic floors at range
//! boundaries; the clamp in [`apply`](crate::operation::apply) absorbs any
//! residual over-length delete.
//!
//! Reference: Ellis & Gibbs (1989), Concurrency Control in Groupware Systems
//! Reference: Sun & Ellis (1998), Operational Transformation in Real-Time
//! Group Editors

use crate::operation::{OpKind, Operation};

/// Transform `a` and `b` against each other, returning `(a', b')`.
///
/// Ties between two inserts at the same index resolve in favor of the
/// first argument: `a` keeps its position and `b` shifts right. Callers
/// control priority by argument order, and every replica must pick the
/// same winner for the same pair.
pub fn transform(a: &Operation, b: &Operation) -> (Operation, Operation) {
    let mut a2 = a.clone();
    let mut b2 = b.clone();

    match (&a.kind, &b.kind) {
        (OpKind::Retain, _) | (_, OpKind::Retain) => {}

        (OpKind::Insert(_), OpKind::Insert(_)) => {
            if a.index <= b.index {
                b2.index = b.index.saturating_add(a.width());
            } else {
                a2.index = a.index.saturating_add(b.width());
            }
        }

        (OpKind::Delete(a_len), OpKind::Delete(b_len)) => {
            // Only indexes move. Lengths stay put and the apply-time
            // truncation soaks up any overlap they still cover.
            if a.index <= b.index {
                b2.index = b.index.saturating_sub(*a_len).max(a.index);
            } else {
                a2.index = a.index.saturating_sub(*b_len).max(b.index);
            }
        }

        (OpKind::Insert(_), OpKind::Delete(b_len)) => {
            if a.index <= b.index {
                b2.index = b.index.saturating_add(a.width());
            } else {
                a2.index = a.index.saturating_sub(*b_len).max(b.index);
            }
        }

        (OpKind::Delete(a_len), OpKind::Insert(_)) => {
            if b.index <= a.index {
                a2.index = a.index.saturating_add(b.width());
            } else {
                b2.index = b.index.saturating_sub(*a_len).max(a.index);
            }
        }
    }

    (a2, b2)
}

//! Konverge apply: desired-document loading, diff/merge and the reconciler.

#![forbid(unsafe_code)]

pub mod diff;
pub mod reconcile;
pub mod redact;
pub mod source;
pub mod wait;

pub use diff::{compute_change, summarize, Change};
pub use reconcile::Reconciler;
pub use source::{parse_documents, DocumentSource};
pub use wait::{wait_for, WaitTarget};

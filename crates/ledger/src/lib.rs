//! Durable payment ledger.
//!
//! One redb table per entity, postcard blobs, single-writer semantics from
//! the node's point of view. The store may be absent: a node that has never
//! written anything gets empty loads, and the backing file is created lazily
//! on the first write.

mod error;
mod store;

pub use error::LedgerError;
pub use store::LedgerStore;

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

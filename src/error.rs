//! Errors reported by the `GenericBPlusTree` data structure
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The key is already present; the tree is left unchanged.
    #[error("key already present in the tree")]
    DuplicateKey,
    /// Bulk load input was not strictly ascending; the tree is left empty.
    #[error("bulk load input must be strictly ascending")]
    UnsortedInput,
}

pub type Result<T> = std::result::Result<T, Error>;

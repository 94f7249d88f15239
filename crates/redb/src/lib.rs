//! Durable persistence for the object world. One redb database file
//! holds every bucket; each exported operation is a single atomic
//! transaction, readers get point-in-time snapshots, and the in-memory
//! cache stays in agreement because only the queue runner writes.

use tinymush_core::{AttrNum, Dbref, StoreError};

mod store;
mod tables;

pub use store::MushStore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    DatabaseError(#[from] redb::DatabaseError),

    #[error(transparent)]
    TransactionError(Box<redb::TransactionError>),

    #[error(transparent)]
    CommitError(#[from] redb::CommitError),

    #[error(transparent)]
    TableError(#[from] redb::TableError),

    #[error(transparent)]
    StorageError(#[from] redb::StorageError),

    #[error("value encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for Error {
    fn from(error: redb::TransactionError) -> Self {
        Error::TransactionError(Box::new(error))
    }
}

impl From<Error> for StoreError {
    fn from(error: Error) -> Self {
        match error {
            Error::Encoding(e) => StoreError::Encoding(e.to_string()),
            other => StoreError::io(other),
        }
    }
}

/// Bias added to dbrefs before key encoding so the sentinels (-1, -2,
/// -3) sort before every real ref.
const DBREF_BIAS: i64 = 1 << 32;

/// 8-byte big-endian key for a dbref.
pub fn dbref_key(dbref: Dbref) -> [u8; 8] {
    ((dbref + DBREF_BIAS) as u64).to_be_bytes()
}

pub fn dbref_from_key(key: &[u8]) -> Dbref {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[..8]);
    u64::from_be_bytes(buf) as i64 - DBREF_BIAS
}

/// 8-byte big-endian key for attribute numbers and other integer keys.
pub fn int_key(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn attr_key(num: AttrNum) -> [u8; 8] {
    int_key(num as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinymush_core::{AMBIGUOUS, HOME, NOTHING};

    #[test]
    fn sentinels_sort_before_real_refs() {
        let home = dbref_key(HOME);
        let ambiguous = dbref_key(AMBIGUOUS);
        let nothing = dbref_key(NOTHING);
        let zero = dbref_key(0);
        let big = dbref_key(123_456);

        assert!(home < ambiguous);
        assert!(ambiguous < nothing);
        assert!(nothing < zero);
        assert!(zero < big);
    }

    #[test]
    fn dbref_key_round_trips() {
        for r in [HOME, AMBIGUOUS, NOTHING, 0, 1, 77, 1 << 20] {
            assert_eq!(dbref_from_key(&dbref_key(r)), r);
        }
    }
}

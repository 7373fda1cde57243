//! storage for root keys and multi-operation entities
use std::collections::HashMap;

use parking_lot::RwLock;
use time::OffsetDateTime;

use crate::crypto::generate_root_key;
use crate::error;
use crate::op::Op;

/// length of the root keys generated by [`MemoryKeyStore`]
const ROOT_KEY_LEN: usize = 24;

/// provides the root keys used to mint and verify macaroons
pub trait RootKeyStore: Send + Sync {
    /// returns the root key with the given id, or `None` if it does not
    /// exist
    fn get(&self, id: &[u8]) -> Result<Option<Vec<u8>>, error::Bakery>;

    /// returns the key used to mint new macaroons, with its id
    fn root_key(&self) -> Result<(Vec<u8>, Vec<u8>), error::Bakery>;
}

/// a [`RootKeyStore`] holding a single key, with id `0`
#[derive(Clone)]
pub struct MemoryKeyStore {
    key: Vec<u8>,
}

const MEMORY_KEY_ID: &[u8] = b"0";

impl MemoryKeyStore {
    /// creates a store with a random key
    pub fn new() -> Self {
        MemoryKeyStore {
            key: generate_root_key(ROOT_KEY_LEN),
        }
    }

    pub fn with_key(key: Vec<u8>) -> Self {
        MemoryKeyStore { key }
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        MemoryKeyStore::new()
    }
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryKeyStore(<redacted>)")
    }
}

impl RootKeyStore for MemoryKeyStore {
    fn get(&self, id: &[u8]) -> Result<Option<Vec<u8>>, error::Bakery> {
        if id != MEMORY_KEY_ID {
            return Ok(None);
        }
        Ok(Some(self.key.clone()))
    }

    fn root_key(&self) -> Result<(Vec<u8>, Vec<u8>), error::Bakery> {
        Ok((self.key.clone(), MEMORY_KEY_ID.to_vec()))
    }
}

/// stores the operations of macaroons minted for several operations, so
/// that their id stays short
pub trait OpsStore: Send + Sync {
    fn put_ops(
        &self,
        entity: &str,
        expiry: OffsetDateTime,
        ops: &[Op],
    ) -> Result<(), error::Bakery>;

    fn get_ops(&self, entity: &str) -> Result<Vec<Op>, error::Bakery>;
}

/// in memory [`OpsStore`], entries are never expired
#[derive(Debug, Default)]
pub struct MemoryOpsStore {
    store: RwLock<HashMap<String, Vec<Op>>>,
}

impl MemoryOpsStore {
    pub fn new() -> Self {
        MemoryOpsStore::default()
    }
}

impl OpsStore for MemoryOpsStore {
    fn put_ops(
        &self,
        entity: &str,
        _expiry: OffsetDateTime,
        ops: &[Op],
    ) -> Result<(), error::Bakery> {
        self.store.write().insert(entity.to_string(), ops.to_vec());
        Ok(())
    }

    fn get_ops(&self, entity: &str) -> Result<Vec<Op>, error::Bakery> {
        self.store.read().get(entity).cloned().ok_or_else(|| {
            error::Bakery::Verification(format!("no operations found for entity {}", entity))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_key_store() {
        let store = MemoryKeyStore::with_key(b"secret".to_vec());
        let (key, id) = store.root_key().unwrap();
        assert_eq!(key, b"secret");
        assert_eq!(store.get(&id).unwrap(), Some(key));
        assert_eq!(store.get(b"1").unwrap(), None);

        let random = MemoryKeyStore::new();
        assert_eq!(random.root_key().unwrap().0.len(), ROOT_KEY_LEN);
    }

    #[test]
    fn memory_ops_store() {
        let store = MemoryOpsStore::new();
        let ops = vec![Op::new("e1", "read"), Op::new("e2", "write")];
        store
            .put_ops("multi-x", OffsetDateTime::now_utc(), &ops)
            .unwrap();
        assert_eq!(store.get_ops("multi-x").unwrap(), ops);
        assert!(store.get_ops("multi-y").is_err());
    }
}

//! Per-user key storage seam.
//!
//! Device-wide keys never pass through here; they live in the database's
//! `device_keys` list. The engine dispatches on
//! [`KeyOwner`](crate::types::KeyOwner) once at the API boundary and
//! everything below sees a uniform interface.

use std::collections::BTreeMap;

use crate::error::Result;

/// Capability interface for the user key store (PKCS#11 token in
/// production).
pub trait KeyStore: Send {
    /// Read a serialized key record. `Ok(None)` means not found.
    fn read(&self, username: &str, label: &str) -> Result<Option<Vec<u8>>>;

    /// Write (or overwrite) a serialized key record.
    fn write(&mut self, username: &str, label: &str, data: &[u8]) -> Result<()>;

    /// Delete one key record. Deleting a missing record is not an error.
    fn delete(&mut self, username: &str, label: &str) -> Result<()>;

    /// Delete every key record whose label starts with `prefix`.
    fn delete_by_prefix(&mut self, username: &str, prefix: &str) -> Result<()>;

    /// Register a key with the user's token so other PKCS#11 consumers can
    /// use it.
    fn register(&mut self, username: &str, label: &str, data: &[u8]) -> Result<()>;
}

/// Volatile key store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    entries: BTreeMap<(String, String), Vec<u8>>,
    registered: Vec<(String, String)>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels registered with the token, in registration order.
    pub fn registered(&self) -> &[(String, String)] {
        &self.registered
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyStore for InMemoryKeyStore {
    fn read(&self, username: &str, label: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .get(&(username.to_string(), label.to_string()))
            .cloned())
    }

    fn write(&mut self, username: &str, label: &str, data: &[u8]) -> Result<()> {
        self.entries
            .insert((username.to_string(), label.to_string()), data.to_vec());
        Ok(())
    }

    fn delete(&mut self, username: &str, label: &str) -> Result<()> {
        self.entries
            .remove(&(username.to_string(), label.to_string()));
        Ok(())
    }

    fn delete_by_prefix(&mut self, username: &str, prefix: &str) -> Result<()> {
        self.entries
            .retain(|(user, label), _| user != username || !label.starts_with(prefix));
        Ok(())
    }

    fn register(&mut self, username: &str, label: &str, _data: &[u8]) -> Result<()> {
        self.registered
            .push((username.to_string(), label.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_delete() {
        let mut store = InMemoryKeyStore::new();
        assert_eq!(store.read("alice", "key-1").unwrap(), None);

        store.write("alice", "key-1", b"record").unwrap();
        assert_eq!(store.read("alice", "key-1").unwrap(), Some(b"record".to_vec()));
        // Other users do not see the record.
        assert_eq!(store.read("bob", "key-1").unwrap(), None);

        store.delete("alice", "key-1").unwrap();
        assert_eq!(store.read("alice", "key-1").unwrap(), None);
        // Deleting again is fine.
        store.delete("alice", "key-1").unwrap();
    }

    #[test]
    fn test_delete_by_prefix_scoped_to_user() {
        let mut store = InMemoryKeyStore::new();
        store.write("alice", "attest-ent-user-1", b"a").unwrap();
        store.write("alice", "attest-ent-user-2", b"b").unwrap();
        store.write("alice", "other", b"c").unwrap();
        store.write("bob", "attest-ent-user-1", b"d").unwrap();

        store.delete_by_prefix("alice", "attest-ent-user").unwrap();

        assert_eq!(store.read("alice", "attest-ent-user-1").unwrap(), None);
        assert_eq!(store.read("alice", "attest-ent-user-2").unwrap(), None);
        assert!(store.read("alice", "other").unwrap().is_some());
        assert!(store.read("bob", "attest-ent-user-1").unwrap().is_some());
    }

    #[test]
    fn test_register_records_label() {
        let mut store = InMemoryKeyStore::new();
        store.register("alice", "key-1", b"record").unwrap();
        assert_eq!(
            store.registered(),
            &[("alice".to_string(), "key-1".to_string())]
        );
    }
}

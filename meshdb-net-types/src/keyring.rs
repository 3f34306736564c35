//! Symmetric key ring for gossip encryption
//!
//! A list of keys with a distinguished primary: the primary encrypts
//! outbound traffic, every installed key is accepted for inbound.
//! Rotation is add → promote → remove, in that order, so mixed-version
//! clusters keep decoding each other throughout.

use bytes::Bytes;
use std::sync::RwLock;

/// Error type for keyring operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    #[error("key {0} is not installed")]
    UnknownKey(String),
    #[error("cannot remove the primary key")]
    RemovePrimary,
}

#[derive(Debug, Default)]
struct KeyringState {
    keys: Vec<Bytes>,
    primary: usize,
}

/// Thread-safe key ring shared between the database handle and the
/// membership substrate.
#[derive(Debug, Default)]
pub struct Keyring {
    state: RwLock<KeyringState>,
}

fn short_id(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(3)])
}

impl Keyring {
    /// Create a ring from an initial key list; the first key becomes
    /// the primary. An empty list means a plaintext cluster.
    pub fn new(keys: Vec<Bytes>) -> Self {
        Self {
            state: RwLock::new(KeyringState { keys, primary: 0 }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read().keys.is_empty()
    }

    /// Install a key. Adding a key that is already present is a no-op.
    pub fn add_key(&self, key: Bytes) {
        let mut state = self.write();
        if state.keys.iter().any(|k| *k == key) {
            return;
        }
        state.keys.push(key);
    }

    /// Promote an already-installed key to primary.
    pub fn use_key(&self, key: &[u8]) -> Result<(), KeyringError> {
        let mut state = self.write();
        match state.keys.iter().position(|k| k == key) {
            Some(idx) => {
                state.primary = idx;
                Ok(())
            }
            None => Err(KeyringError::UnknownKey(short_id(key))),
        }
    }

    /// Remove an installed key. The primary cannot be removed.
    pub fn remove_key(&self, key: &[u8]) -> Result<(), KeyringError> {
        let mut state = self.write();
        match state.keys.iter().position(|k| k == key) {
            Some(idx) if idx == state.primary => Err(KeyringError::RemovePrimary),
            Some(idx) => {
                state.keys.remove(idx);
                // Keep the primary index pointing at the same key
                if idx < state.primary {
                    state.primary -= 1;
                }
                Ok(())
            }
            None => Err(KeyringError::UnknownKey(short_id(key))),
        }
    }

    /// The key used for outbound encryption, if any.
    pub fn primary_key(&self) -> Option<Bytes> {
        let state = self.read();
        state.keys.get(state.primary).cloned()
    }

    /// Whether `key` is accepted for inbound traffic.
    pub fn accepts(&self, key: &[u8]) -> bool {
        self.read().keys.iter().any(|k| k == key)
    }

    pub fn keys(&self) -> Vec<Bytes> {
        self.read().keys.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, KeyringState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, KeyringState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> Bytes {
        Bytes::from(vec![b; 16])
    }

    #[test]
    fn first_key_is_primary() {
        let ring = Keyring::new(vec![key(1), key(2)]);
        assert_eq!(ring.primary_key(), Some(key(1)));
        assert!(ring.accepts(&key(2)));
    }

    #[test]
    fn add_is_idempotent() {
        let ring = Keyring::new(vec![key(1)]);
        ring.add_key(key(1));
        ring.add_key(key(2));
        ring.add_key(key(2));
        assert_eq!(ring.keys().len(), 2);
    }

    #[test]
    fn promote_requires_installed_key() {
        let ring = Keyring::new(vec![key(1)]);
        assert!(matches!(
            ring.use_key(&key(9)),
            Err(KeyringError::UnknownKey(_))
        ));
        ring.add_key(key(2));
        ring.use_key(&key(2)).unwrap();
        assert_eq!(ring.primary_key(), Some(key(2)));
    }

    #[test]
    fn primary_cannot_be_removed() {
        let ring = Keyring::new(vec![key(1), key(2)]);
        assert!(matches!(
            ring.remove_key(&key(1)),
            Err(KeyringError::RemovePrimary)
        ));
        ring.use_key(&key(2)).unwrap();
        ring.remove_key(&key(1)).unwrap();
        assert_eq!(ring.primary_key(), Some(key(2)));
        assert!(!ring.accepts(&key(1)));
    }

    #[test]
    fn full_rotation_keeps_old_key_accepted_until_removed() {
        let ring = Keyring::new(vec![key(1)]);
        ring.add_key(key(2));
        ring.use_key(&key(2)).unwrap();
        // Old key still accepted for inbound during the rotation window
        assert!(ring.accepts(&key(1)));
        ring.remove_key(&key(1)).unwrap();
        assert!(!ring.accepts(&key(1)));
    }
}

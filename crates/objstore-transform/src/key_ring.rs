//! Master key ring for envelope encryption with key rotation support.
//!
//! One key is *current* and wraps every new object key. Previously current keys, and any
//! keys added explicitly, are *retained* and only ever used to unwrap objects written
//! under them. Keys are looked up by fingerprint and never dropped automatically.

use crate::keys::MasterKeyPair;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::info;

struct KeyRingState {
    current: Arc<MasterKeyPair>,
    retained: HashMap<String, Arc<MasterKeyPair>>,
}

/// Current master key plus retained decryption keys, indexed by fingerprint.
///
/// Lookups take a shared lock, so any number of decodes can resolve keys concurrently.
/// Rotation takes the exclusive lock for the duration of a map insert.
pub struct MasterKeyRing {
    state: RwLock<KeyRingState>,
}

impl Debug for MasterKeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MasterKeyRing")
            .field("current", &state.current.fingerprint())
            .field("retained", &state.retained.len())
            .finish()
    }
}

impl MasterKeyRing {
    /// Creates a key ring with a current key and no retained keys.
    pub fn new(current: MasterKeyPair) -> Self {
        Self {
            state: RwLock::new(KeyRingState {
                current: Arc::new(current),
                retained: HashMap::new(),
            }),
        }
    }

    /// Creates a key ring with a current key and a set of retained decryption keys.
    pub fn with_retained<I>(current: MasterKeyPair, retained: I) -> Self
    where
        I: IntoIterator<Item = MasterKeyPair>,
    {
        let ring = Self::new(current);
        for key in retained {
            ring.add_retained(key);
        }
        ring
    }

    /// The key that wraps new object keys.
    pub fn current(&self) -> Arc<MasterKeyPair> {
        Arc::clone(&self.state.read().current)
    }

    /// Fingerprint of the current key.
    pub fn current_fingerprint(&self) -> String {
        self.state.read().current.fingerprint().to_string()
    }

    /// Resolve a fingerprint against the current key and all retained keys.
    pub fn find(&self, fingerprint: &str) -> Option<Arc<MasterKeyPair>> {
        let state = self.state.read();
        if state.current.fingerprint() == fingerprint {
            return Some(Arc::clone(&state.current));
        }
        state.retained.get(fingerprint).cloned()
    }

    /// True if `fingerprint` names the current key or a retained key.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.find(fingerprint).is_some()
    }

    /// True if `fingerprint` names the current key.
    pub fn is_current(&self, fingerprint: &str) -> bool {
        self.state.read().current.fingerprint() == fingerprint
    }

    /// Make `new_key` current. The previous current key is retained for decryption.
    /// Returns the fingerprint of the new current key.
    pub fn rotate(&self, new_key: MasterKeyPair) -> String {
        let new_fingerprint = new_key.fingerprint().to_string();
        let mut state = self.state.write();
        if state.current.fingerprint() == new_fingerprint {
            return new_fingerprint;
        }
        let new_current = state
            .retained
            .remove(&new_fingerprint)
            .unwrap_or_else(|| Arc::new(new_key));
        let previous = std::mem::replace(&mut state.current, new_current);
        let previous_fingerprint = previous.fingerprint().to_string();
        state.retained.insert(previous_fingerprint.clone(), previous);
        info!(
            previous = %previous_fingerprint,
            current = %new_fingerprint,
            retained = state.retained.len(),
            "master key rotated"
        );
        new_fingerprint
    }

    /// Keep `key` available for decryption without making it current.
    pub fn add_retained(&self, key: MasterKeyPair) {
        let fingerprint = key.fingerprint().to_string();
        let mut state = self.state.write();
        if state.current.fingerprint() == fingerprint {
            return;
        }
        state.retained.insert(fingerprint, Arc::new(key));
    }

    /// Fingerprints of every key in the ring, current first, retained sorted.
    pub fn fingerprints(&self) -> Vec<String> {
        let state = self.state.read();
        let mut retained: Vec<String> = state.retained.keys().cloned().collect();
        retained.sort();
        let mut all = Vec::with_capacity(retained.len() + 1);
        all.push(state.current.fingerprint().to_string());
        all.extend(retained);
        all
    }

    /// Number of retained (non-current) keys.
    pub fn retained_len(&self) -> usize {
        self.state.read().retained.len()
    }
}

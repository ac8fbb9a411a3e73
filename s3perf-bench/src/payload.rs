//! Object contents and keys for the write phase.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use uuid::Uuid;

/// Randomized contents of an object.
///
/// Clone this instance to reproduce the same contents, or construct it from the same seed.
#[derive(Debug, Clone)]
pub struct Payload {
    /// The length of the payload in bytes.
    pub len: u64,
    /// The RNG used to fill the payload with random bytes.
    pub rng: SmallRng,
}

impl Payload {
    /// Creates a payload of `len` bytes whose contents are derived from `seed`.
    pub fn new(len: u64, seed: u64) -> Self {
        Self {
            len,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Creates a payload of `len` bytes with random contents.
    pub fn random(len: u64) -> Self {
        Self::new(len, rand::random())
    }

    /// Materializes the payload.
    pub fn into_bytes(mut self) -> Bytes {
        let mut buf = vec![0; self.len as usize];
        self.rng.fill_bytes(&mut buf);
        buf.into()
    }
}

/// Generates a fresh object key below `prefix`.
///
/// The random part is a UUID with its characters reversed. UUIDs rendered as text share no
/// structure at their end, so reversing puts the most random characters first and spreads
/// consecutive writes across the key space of stores that partition by key prefix.
pub fn object_key(prefix: &str) -> String {
    let id = Uuid::new_v4().to_string();
    let mut key = String::with_capacity(prefix.len() + id.len());
    key.push_str(prefix);
    key.extend(id.chars().rev());
    key
}

/// The keys written during one benchmark round.
///
/// Writer tasks insert concurrently; the read phase takes the whole set once all writes settled.
#[derive(Debug, Default)]
pub struct KeySet(Mutex<HashSet<String>>);

impl KeySet {
    /// Creates an empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a successfully written key.
    pub fn insert(&self, key: String) {
        self.lock().insert(key);
    }

    /// Returns the number of keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no key has been written.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns all keys.
    pub fn take(&self) -> Vec<String> {
        self.lock().drain().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

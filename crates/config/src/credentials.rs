//! Round-robin credential pools.
//!
//! Capabilities and provider adapters ask for a credential by name
//! (`"OPENAI_API_KEY"`, `"brave-search"`, ...).  Names are normalised to
//! `UPPER_SNAKE` so config tables and env vars agree, and each request takes
//! the next key of the pool so load and rate limits spread across keys.

use std::collections::HashMap;
use std::env;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Upper-case the name and replace everything that is not ASCII
/// alphanumeric with `_`.
pub fn normalize_credential_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

#[derive(Debug, Default)]
struct Pool {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl Pool {
    fn next(&self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        Some(self.keys[idx].clone())
    }
}

/// Credential pools keyed by normalised name.
///
/// Pools not configured explicitly are discovered from the environment:
/// `NAME` plus `NAME_1`, `NAME_2`, ... until the first gap.
#[derive(Debug, Default)]
pub struct CredentialStore {
    pools: HashMap<String, Pool>,
    env_cursors: Mutex<HashMap<String, usize>>,
}

impl CredentialStore {
    pub fn insert_pool(&mut self, name: &str, keys: Vec<String>) {
        let keys = keys
            .into_iter()
            .filter(|k| !k.trim().is_empty())
            .collect::<Vec<_>>();
        self.pools.insert(
            normalize_credential_name(name),
            Pool {
                keys,
                cursor: AtomicUsize::new(0),
            },
        );
    }

    /// Next key of the named pool, wrapping modulo the pool size.
    pub fn next(&self, name: &str) -> Option<String> {
        let name = normalize_credential_name(name);
        if name.is_empty() {
            return None;
        }
        if let Some(pool) = self.pools.get(&name) {
            if !pool.keys.is_empty() {
                return pool.next();
            }
        }

        let keys = env_keys(&name);
        if keys.is_empty() {
            return None;
        }
        let mut cursors = self
            .env_cursors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let cursor = cursors.entry(name).or_insert(0);
        let key = keys[*cursor % keys.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(key)
    }

    pub fn has(&self, name: &str) -> bool {
        self.pool_size(name) > 0
    }

    pub fn pool_size(&self, name: &str) -> usize {
        let name = normalize_credential_name(name);
        match self.pools.get(&name) {
            Some(pool) if !pool.keys.is_empty() => pool.keys.len(),
            _ => env_keys(&name).len(),
        }
    }
}

fn env_keys(name: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Ok(value) = env::var(name) {
        if !value.trim().is_empty() {
            keys.push(value);
        }
    }
    for i in 1.. {
        match env::var(format!("{name}_{i}")) {
            Ok(value) if !value.trim().is_empty() => keys.push(value),
            _ => break,
        }
    }
    keys
}

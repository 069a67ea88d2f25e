//! In-process gossip hub.
//!
//! Subsystems subscribe to key prefixes and producers publish key/payload
//! pairs. Payload encoding is agreed between producer and subscriber and is
//! opaque to the hub; the hub retains the latest payload per key so late
//! readers can look state up directly.
//!
//! Callbacks run synchronously on the publisher's thread and must be short
//! and non-blocking.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Callback invoked with the full key and the raw payload.
pub type Callback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct Subscription {
    prefix: String,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    infos: HashMap<String, Vec<u8>>,
    subscriptions: Vec<Subscription>,
}

#[derive(Default)]
pub struct Gossip {
    mu: RwLock<Inner>,
}

impl Gossip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to every key starting with `prefix`.
    pub fn register_callback<F>(&self, prefix: impl Into<String>, callback: F)
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        let mut inner = self.mu.write().unwrap();
        inner.subscriptions.push(Subscription {
            prefix: prefix.into(),
            callback: Arc::new(callback),
        });
    }

    /// Store `payload` under `key` and notify matching subscribers.
    pub fn add_info(&self, key: &str, payload: Vec<u8>) {
        let matching: Vec<Callback> = {
            let mut inner = self.mu.write().unwrap();
            inner.infos.insert(key.to_string(), payload.clone());
            inner
                .subscriptions
                .iter()
                .filter(|sub| key.starts_with(&sub.prefix))
                .map(|sub| sub.callback.clone())
                .collect()
        };
        // Dispatch outside the lock so callbacks may publish in turn.
        for callback in matching {
            callback(key, &payload);
        }
    }

    /// Latest payload stored under `key`, if any.
    pub fn info(&self, key: &str) -> Option<Vec<u8>> {
        self.mu.read().unwrap().infos.get(key).cloned()
    }
}

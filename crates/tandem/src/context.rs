//! The per-transaction payload.
//!
//! A [`Context`] is a string-keyed attribute bag that flows through one
//! pipeline run. Every attribute is tagged volatile or persistent: only the
//! persistent subset crosses a serialize boundary (a pause/resume hand-off or
//! a crash-recovery snapshot), volatile attributes are dropped there.
//!
//! A Context doubles as the caller's result slot: [`Context::get_wait`]
//! blocks until the pipeline populates a named attribute, with the same
//! broadcast wait discipline as [`crate::Space`]. A caller never sees
//! participant failures through this slot — on a timeout it simply gets
//! `None`.
//!
//! Clones are shallow; the producer and the worker session share one bag.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

struct Attr {
    value: Value,
    persistent: bool,
}

/// One named elapsed-time marker on a Context's trail.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub tag: String,
    /// Elapsed time since the Context was created.
    pub elapsed: Duration,
    pub at: DateTime<Utc>,
}

struct Inner {
    state: Mutex<State>,
    version: watch::Sender<u64>,
}

struct State {
    attrs: HashMap<String, Attr>,
    trail: Vec<Checkpoint>,
    created: Instant,
}

/// Serializable attribute bag with volatile/persistent partitioning and a
/// blocking result slot.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    attrs: HashMap::new(),
                    trail: Vec::new(),
                    created: Instant::now(),
                }),
                version: watch::Sender::new(0),
            }),
        }
    }

    /// Set a volatile attribute. Wakes anyone blocked in [`Context::get_wait`]
    /// on this name.
    pub fn put(&self, name: &str, value: impl Into<Value>) {
        self.insert(name, value.into(), false);
    }

    /// Set a persistent attribute: it survives pause/resume and recovery
    /// snapshots.
    pub fn put_persistent(&self, name: &str, value: impl Into<Value>) {
        self.insert(name, value.into(), true);
    }

    fn insert(&self, name: &str, value: Value, persistent: bool) {
        let mut state = self.inner.state.lock().expect("context lock poisoned");
        state.attrs.insert(name.to_string(), Attr { value, persistent });
        self.inner.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let state = self.inner.state.lock().expect("context lock poisoned");
        state.attrs.get(name).map(|a| a.value.clone())
    }

    pub fn get_or(&self, name: &str, default: Value) -> Value {
        self.get(name).unwrap_or(default)
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        let mut state = self.inner.state.lock().expect("context lock poisoned");
        state.attrs.remove(name).map(|a| a.value)
    }

    /// Promote an existing attribute to persistent for the next serialize
    /// boundary. No-op if the attribute is absent.
    pub fn persist(&self, name: &str) {
        self.set_persistence(name, true);
    }

    /// Demote an existing attribute to volatile.
    pub fn evict(&self, name: &str) {
        self.set_persistence(name, false);
    }

    fn set_persistence(&self, name: &str, persistent: bool) {
        let mut state = self.inner.state.lock().expect("context lock poisoned");
        if let Some(attr) = state.attrs.get_mut(name) {
            attr.persistent = persistent;
        }
    }

    /// Block until `name` is populated or `timeout` elapses.
    ///
    /// This is the result-publication slot: the original caller parks here
    /// while the pipeline runs.
    pub async fn get_wait(&self, name: &str, timeout: Duration) -> Option<Value> {
        let mut rx = self.inner.version.subscribe();
        let wait = async {
            loop {
                {
                    let state = self.inner.state.lock().expect("context lock poisoned");
                    rx.borrow_and_update();
                    if let Some(attr) = state.attrs.get(name) {
                        return attr.value.clone();
                    }
                }
                let _ = rx.changed().await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    /// Append a named marker to the trail, recording elapsed time since the
    /// Context was created.
    pub fn checkpoint(&self, tag: &str) {
        let mut state = self.inner.state.lock().expect("context lock poisoned");
        let elapsed = state.created.elapsed();
        state.trail.push(Checkpoint {
            tag: tag.to_string(),
            elapsed,
            at: Utc::now(),
        });
    }

    pub fn trail(&self) -> Vec<Checkpoint> {
        let state = self.inner.state.lock().expect("context lock poisoned");
        state.trail.clone()
    }

    /// The persistent subset as a plain JSON object. This is exactly what a
    /// recovery snapshot stores.
    pub fn to_snapshot(&self) -> Value {
        let state = self.inner.state.lock().expect("context lock poisoned");
        let map: BTreeMap<&String, &Value> = state
            .attrs
            .iter()
            .filter(|(_, a)| a.persistent)
            .map(|(k, a)| (k, &a.value))
            .collect();
        serde_json::to_value(map).expect("json map serializes")
    }

    /// Rebuild a Context from a snapshot; every restored attribute is
    /// persistent.
    pub fn from_snapshot(snapshot: &Value) -> Self {
        let ctx = Context::new();
        if let Value::Object(map) = snapshot {
            for (k, v) in map {
                ctx.put_persistent(k, v.clone());
            }
        }
        ctx
    }
}

impl Serialize for Context {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Context {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let snapshot = Value::deserialize(deserializer)?;
        Ok(Context::from_snapshot(&snapshot))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("context lock poisoned");
        let mut dbg = f.debug_map();
        for (k, a) in &state.attrs {
            dbg.entry(&format_args!("{}{}", k, if a.persistent { "*" } else { "" }), &a.value);
        }
        dbg.finish()
    }
}

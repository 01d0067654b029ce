//! Named-space registry.
//!
//! Components reach a shared [`Space`] by string name through an explicit
//! registry object injected via configuration, not a process-wide static.
//! Spaces are created on first use and dropped together at
//! [`SpaceRegistry::shutdown`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::space::Space;

pub struct SpaceRegistry<V> {
    spaces: Mutex<HashMap<String, Arc<Space<V>>>>,
}

impl<V> Default for SpaceRegistry<V>
where
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SpaceRegistry<V>
where
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            spaces: Mutex::new(HashMap::new()),
        }
    }

    /// The space registered under `name`, created on first use.
    pub fn space(&self, name: &str) -> Arc<Space<V>> {
        let mut spaces = self.spaces.lock().expect("registry lock poisoned");
        Arc::clone(
            spaces
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Space::new())),
        )
    }

    /// Names of every space created so far.
    pub fn names(&self) -> Vec<String> {
        let spaces = self.spaces.lock().expect("registry lock poisoned");
        spaces.keys().cloned().collect()
    }

    /// Drop every registered space. Holders of an `Arc` keep theirs alive,
    /// but the registry hands out fresh instances afterwards.
    pub fn shutdown(&self) {
        self.spaces.lock().expect("registry lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_name_yields_same_space() {
        let reg: SpaceRegistry<u32> = SpaceRegistry::new();
        let a = reg.space("auth");
        let b = reg.space("auth");
        assert!(Arc::ptr_eq(&a, &b));
        a.out("k", 1);
        assert_eq!(b.try_take("k"), Some(1));
    }

    #[tokio::test]
    async fn shutdown_detaches_names() {
        let reg: SpaceRegistry<u32> = SpaceRegistry::new();
        let before = reg.space("auth");
        before.out("k", 1);
        reg.shutdown();
        assert!(reg.names().is_empty());
        let after = reg.space("auth");
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.try_take("k"), None);
    }
}

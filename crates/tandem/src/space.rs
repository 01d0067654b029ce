//! The tuple-space coordination primitive.
//!
//! A [`Space`] is a keyed, blocking multiset: every key maps to an ordered
//! list of entries, producers append ([`Space::out`]) or prepend
//! ([`Space::push`]) values, and consumers probe or block for them. Entries
//! may carry a lease (an absolute expiry instant) after which they are
//! semantically absent from every operation.
//!
//! ## Wakeup discipline
//!
//! Each key owns a `tokio::sync::watch` channel carrying a version counter.
//! Mutations bump the version *while holding the table lock*, and waiters
//! mark the current version as seen under that same lock before they sleep,
//! so there is no window in which an arrival can be missed. Wakeup is a
//! broadcast: every waiter on the key re-checks its predicate, and only one
//! destructive ([`Space::take`]) caller actually removes the entry.
//!
//! Listener callbacks run after the entry is stored and outside the lock, so
//! a listener is free to call back into the space.
//!
//! Key slots are reclaimed lazily. A wait on a never-written key creates an
//! empty slot, and if the wait times out the slot lingers until the next
//! probe of that key or [`Space::gc`] sweeps it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// A value-shaped matcher used to select a specific entry among several
/// stored under one key.
///
/// Blanket-implemented for closures, so `space.try_take_match(k, |v| ...)`
/// works without a named type.
pub trait Template<V>: Send + Sync {
    fn matches(&self, candidate: &V) -> bool;
}

impl<V, F> Template<V> for F
where
    F: Fn(&V) -> bool + Send + Sync,
{
    fn matches(&self, candidate: &V) -> bool {
        self(candidate)
    }
}

/// Observer invoked on every successful `out`/`push` to a key it is
/// registered on. Invoked outside the space's internal lock.
pub trait SpaceListener<V>: Send + Sync {
    fn notify(&self, key: &str, value: &V);
}

impl<V, F> SpaceListener<V> for F
where
    F: Fn(&str, &V) + Send + Sync,
{
    fn notify(&self, key: &str, value: &V) {
        self(key, value)
    }
}

struct Entry<V> {
    value: V,
    /// Lease: absolute expiry instant. `None` means the entry never expires.
    expires: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}

struct ListenerReg<V> {
    listener: Arc<dyn SpaceListener<V>>,
    expires: Option<Instant>,
}

struct KeySlot<V> {
    entries: VecDeque<Entry<V>>,
    listeners: Vec<ListenerReg<V>>,
    /// Version counter; bumped under the table lock on every mutation.
    version: watch::Sender<u64>,
}

impl<V> KeySlot<V> {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            listeners: Vec::new(),
            version: watch::Sender::new(0),
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Drop expired entries and listener registrations.
    fn prune(&mut self, now: Instant) {
        self.entries.retain(|e| !e.is_expired(now));
        self.listeners.retain(|l| !l.expires.is_some_and(|at| at <= now));
    }

    /// A slot can be dropped once it holds nothing, observes nothing, and
    /// nobody is blocked on it.
    fn is_removable(&self) -> bool {
        self.entries.is_empty()
            && self.listeners.is_empty()
            && self.version.receiver_count() == 0
    }

    fn live_listeners(&self, now: Instant) -> Vec<Arc<dyn SpaceListener<V>>> {
        self.listeners
            .iter()
            .filter(|l| !l.expires.is_some_and(|at| at <= now))
            .map(|l| Arc::clone(&l.listener))
            .collect()
    }
}

enum End {
    Head,
    Tail,
}

/// Keyed, blocking, lease-aware multiset with template-based retrieval and
/// change notification.
///
/// `Space` is `Send + Sync`; share it behind an `Arc` between any number of
/// producers and consumers.
pub struct Space<V> {
    table: Mutex<HashMap<String, KeySlot<V>>>,
}

impl<V> Default for Space<V>
where
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Space<V>
where
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Append `value` to the tail of `key`'s entry list (FIFO) and wake
    /// every waiter blocked on that key.
    pub fn out(&self, key: &str, value: V) {
        self.insert(key, value, None, End::Tail);
    }

    /// Like [`Space::out`] but the entry expires `ttl` from now.
    pub fn out_ttl(&self, key: &str, value: V, ttl: Duration) {
        self.insert(key, value, Some(Instant::now() + ttl), End::Tail);
    }

    /// Prepend `value` to the head of `key`'s entry list (LIFO relative to
    /// subsequent probes).
    pub fn push(&self, key: &str, value: V) {
        self.insert(key, value, None, End::Head);
    }

    /// Like [`Space::push`] but the entry expires `ttl` from now.
    pub fn push_ttl(&self, key: &str, value: V, ttl: Duration) {
        self.insert(key, value, Some(Instant::now() + ttl), End::Head);
    }

    fn insert(&self, key: &str, value: V, expires: Option<Instant>, end: End) {
        let now = Instant::now();
        let listeners = {
            let mut table = self.table.lock().expect("space lock poisoned");
            let slot = table.entry(key.to_string()).or_insert_with(KeySlot::new);
            slot.prune(now);
            let listeners = slot.live_listeners(now);
            // Keep a copy for listener dispatch outside the lock.
            let copy = if listeners.is_empty() {
                None
            } else {
                Some(value.clone())
            };
            let entry = Entry { value, expires };
            match end {
                End::Tail => slot.entries.push_back(entry),
                End::Head => slot.entries.push_front(entry),
            }
            slot.bump();
            copy.map(|v| (listeners, v))
        };
        if let Some((listeners, value)) = listeners {
            for l in listeners {
                l.notify(key, &value);
            }
        }
    }

    // ------------------------------------------------------------------
    // Non-blocking probes
    // ------------------------------------------------------------------

    /// Non-destructive probe: the head non-expired entry of `key`, if any.
    /// Expired entries scanned over are discarded as a side effect.
    pub fn try_read(&self, key: &str) -> Option<V> {
        self.probe(key, None, false)
    }

    /// Destructive probe: remove and return the head non-expired entry.
    pub fn try_take(&self, key: &str) -> Option<V> {
        self.probe(key, None, true)
    }

    /// Non-destructive probe for the first entry matching `template`,
    /// scanning the key's entries in order.
    pub fn try_read_match(&self, key: &str, template: &dyn Template<V>) -> Option<V> {
        self.probe(key, Some(template), false)
    }

    /// Destructive probe for the first entry matching `template`. Entries
    /// that do not match keep their original order.
    pub fn try_take_match(&self, key: &str, template: &dyn Template<V>) -> Option<V> {
        self.probe(key, Some(template), true)
    }

    fn probe(&self, key: &str, template: Option<&dyn Template<V>>, remove: bool) -> Option<V> {
        let now = Instant::now();
        let mut table = self.table.lock().expect("space lock poisoned");
        let slot = table.get_mut(key)?;
        slot.prune(now);
        let idx = match template {
            Some(t) => slot.entries.iter().position(|e| t.matches(&e.value)),
            None => (!slot.entries.is_empty()).then_some(0),
        };
        let found = match idx {
            Some(i) if remove => {
                let entry = slot.entries.remove(i).expect("index in range");
                slot.bump();
                Some(entry.value)
            }
            Some(i) => Some(slot.entries[i].value.clone()),
            None => None,
        };
        if slot.is_removable() {
            table.remove(key);
        }
        found
    }

    // ------------------------------------------------------------------
    // Blocking reads
    // ------------------------------------------------------------------

    /// Block until `key` holds a non-expired entry; return a copy without
    /// removing it.
    pub async fn read(&self, key: &str) -> V {
        self.wait(key, false).await
    }

    /// Bounded [`Space::read`]: `None` if the wait times out. A timeout has
    /// no side effects beyond lazily discarding expired entries scanned.
    pub async fn read_timeout(&self, key: &str, timeout: Duration) -> Option<V> {
        tokio::time::timeout(timeout, self.wait(key, false)).await.ok()
    }

    /// Block until `key` holds a non-expired entry; remove and return it.
    /// Under contention exactly one concurrent `take` wins each entry.
    pub async fn take(&self, key: &str) -> V {
        self.wait(key, true).await
    }

    /// Bounded [`Space::take`]: `None` if the wait times out.
    pub async fn take_timeout(&self, key: &str, timeout: Duration) -> Option<V> {
        tokio::time::timeout(timeout, self.wait(key, true)).await.ok()
    }

    async fn wait(&self, key: &str, remove: bool) -> V {
        let mut rx = self.subscribe(key);
        loop {
            // Scan and mark the version seen under one lock acquisition, so
            // an arrival after the scan is guaranteed to trip `changed()`.
            {
                let now = Instant::now();
                let mut table = self.table.lock().expect("space lock poisoned");
                let slot = table.get_mut(key).expect("subscribed slot exists");
                rx.borrow_and_update();
                slot.prune(now);
                if !slot.entries.is_empty() {
                    let value = if remove {
                        let entry = slot.entries.pop_front().expect("non-empty");
                        slot.bump();
                        entry.value
                    } else {
                        slot.entries[0].value.clone()
                    };
                    return value;
                }
            }
            // Sender lives as long as we hold a receiver.
            let _ = rx.changed().await;
        }
    }

    fn subscribe(&self, key: &str) -> watch::Receiver<u64> {
        let mut table = self.table.lock().expect("space lock poisoned");
        table
            .entry(key.to_string())
            .or_insert_with(KeySlot::new)
            .version
            .subscribe()
    }

    // ------------------------------------------------------------------
    // Compound waits
    // ------------------------------------------------------------------

    /// Return `true` as soon as any of `keys` holds a non-expired entry,
    /// without consuming it; `false` if none does within `timeout`.
    pub async fn exist_any(&self, keys: &[&str], timeout: Duration) -> bool {
        if keys.is_empty() {
            return false;
        }
        let check = |space: &Space<V>| {
            let now = Instant::now();
            let mut table = space.table.lock().expect("space lock poisoned");
            keys.iter().any(|k| {
                table
                    .get_mut(*k)
                    .map(|slot| {
                        slot.prune(now);
                        !slot.entries.is_empty()
                    })
                    .unwrap_or(false)
            })
        };
        let wait = async {
            let mut rxs: Vec<_> = keys.iter().map(|k| self.subscribe(k)).collect();
            loop {
                for rx in &mut rxs {
                    rx.borrow_and_update();
                }
                if check(self) {
                    return;
                }
                let changed = rxs.iter_mut().map(|rx| Box::pin(rx.changed()));
                let _ = futures::future::select_all(changed).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// The complement of [`Space::read`]: block until `key` holds **no**
    /// non-expired entry. Used to detect a drained queue.
    pub async fn wait_drained(&self, key: &str) {
        let mut rx = self.subscribe(key);
        loop {
            {
                let now = Instant::now();
                let mut table = self.table.lock().expect("space lock poisoned");
                let slot = table.get_mut(key).expect("subscribed slot exists");
                rx.borrow_and_update();
                slot.prune(now);
                if slot.entries.is_empty() {
                    return;
                }
            }
            let _ = rx.changed().await;
        }
    }

    /// Bounded [`Space::wait_drained`]: `true` if the key drained in time.
    pub async fn wait_drained_timeout(&self, key: &str, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_drained(key)).await.is_ok()
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Register `listener` for `key`. Independent of blocking waiters.
    pub fn add_listener(&self, key: &str, listener: Arc<dyn SpaceListener<V>>) {
        self.register_listener(key, listener, None);
    }

    /// Register a listener that drops out of rotation after `ttl`.
    pub fn add_listener_ttl(&self, key: &str, listener: Arc<dyn SpaceListener<V>>, ttl: Duration) {
        self.register_listener(key, listener, Some(Instant::now() + ttl));
    }

    fn register_listener(
        &self,
        key: &str,
        listener: Arc<dyn SpaceListener<V>>,
        expires: Option<Instant>,
    ) {
        let mut table = self.table.lock().expect("space lock poisoned");
        table
            .entry(key.to_string())
            .or_insert_with(KeySlot::new)
            .listeners
            .push(ListenerReg { listener, expires });
    }

    /// Deregister a previously added listener (matched by `Arc` identity).
    pub fn remove_listener(&self, key: &str, listener: &Arc<dyn SpaceListener<V>>) {
        let mut table = self.table.lock().expect("space lock poisoned");
        if let Some(slot) = table.get_mut(key) {
            slot.listeners
                .retain(|l| !Arc::ptr_eq(&l.listener, listener));
            if slot.is_removable() {
                table.remove(key);
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Eagerly sweep every key, removing expired entries and listener
    /// registrations. Safe to call concurrently with all other operations.
    pub fn gc(&self) {
        let now = Instant::now();
        let mut table = self.table.lock().expect("space lock poisoned");
        table.retain(|_, slot| {
            let before = slot.entries.len();
            slot.prune(now);
            if slot.entries.len() != before {
                slot.bump();
            }
            !slot.is_removable()
        });
    }

    /// Number of non-expired entries currently under `key`.
    pub fn size(&self, key: &str) -> usize {
        let now = Instant::now();
        let mut table = self.table.lock().expect("space lock poisoned");
        match table.get_mut(key) {
            Some(slot) => {
                slot.prune(now);
                slot.entries.len()
            }
            None => 0,
        }
    }

    /// Keys that currently hold at least one non-expired entry.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut table = self.table.lock().expect("space lock poisoned");
        table
            .iter_mut()
            .filter_map(|(k, slot)| {
                slot.prune(now);
                (!slot.entries.is_empty()).then(|| k.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn out_is_fifo() {
        let sp = Space::new();
        sp.out("k", "A");
        sp.out("k", "B");
        assert_eq!(sp.try_take("k"), Some("A"));
        assert_eq!(sp.try_take("k"), Some("B"));
        assert_eq!(sp.try_take("k"), None);
    }

    #[tokio::test]
    async fn push_is_lifo_relative_to_out() {
        let sp = Space::new();
        sp.push("k", "ONE");
        sp.push("k", "TWO");
        sp.push("k", "THREE");
        sp.out("k", "FOUR");
        for expected in ["THREE", "TWO", "ONE", "FOUR"] {
            assert_eq!(sp.try_take("k"), Some(expected));
        }
        assert_eq!(sp.try_take("k"), None);
    }

    #[tokio::test]
    async fn leased_entry_expires() {
        let sp = Space::new();
        sp.out_ttl("k", "ABC", Duration::from_millis(50));
        assert_eq!(sp.try_read("k"), Some("ABC"));
        tokio::time::sleep(Duration::from_millis(75)).await;
        assert_eq!(sp.try_read("k"), None);
    }

    #[tokio::test]
    async fn template_take_preserves_order_of_non_matches() {
        let sp = Space::new();
        sp.out("k", "123");
        sp.out("k", "456");
        sp.out("k", "789");
        let got = sp.try_take_match("k", &|v: &&str| *v == "456");
        assert_eq!(got, Some("456"));
        assert_eq!(sp.try_take("k"), Some("123"));
        assert_eq!(sp.try_take("k"), Some("789"));
        assert_eq!(sp.try_take("k"), None);
    }

    #[tokio::test]
    async fn read_does_not_consume() {
        let sp = Space::new();
        sp.out("k", 7u32);
        assert_eq!(sp.try_read("k"), Some(7));
        assert_eq!(sp.try_read("k"), Some(7));
        assert_eq!(sp.try_take("k"), Some(7));
        assert_eq!(sp.try_read("k"), None);
    }

    #[tokio::test]
    async fn out_broadcasts_to_all_blocked_readers() {
        let sp = Arc::new(Space::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let sp = Arc::clone(&sp);
            handles.push(tokio::spawn(async move {
                sp.read_timeout("k", Duration::from_secs(5)).await
            }));
        }
        // Let the readers park before the single out.
        tokio::time::sleep(Duration::from_millis(20)).await;
        sp.out("k", "v");
        for h in handles {
            assert_eq!(h.await.unwrap(), Some("v"));
        }
    }

    #[tokio::test]
    async fn no_cross_key_wakeup() {
        let sp = Arc::new(Space::new());
        let waiter = {
            let sp = Arc::clone(&sp);
            tokio::spawn(async move { sp.take_timeout("A", Duration::from_millis(200)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sp.out("B", "noise");
        assert_eq!(waiter.await.unwrap(), None);
        // The entry on B is untouched.
        assert_eq!(sp.try_take("B"), Some("noise"));
    }

    #[tokio::test]
    async fn contended_take_delivers_each_entry_once() {
        let sp = Arc::new(Space::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let sp = Arc::clone(&sp);
            handles.push(tokio::spawn(async move {
                sp.take_timeout("k", Duration::from_millis(500)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        sp.out("k", 1u32);
        let mut won = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn exist_any_sees_late_arrival_without_consuming() {
        let sp = Arc::new(Space::new());
        let probe = {
            let sp = Arc::clone(&sp);
            tokio::spawn(async move {
                sp.exist_any(&["a", "b", "c"], Duration::from_secs(2)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sp.out("b", "x");
        assert!(probe.await.unwrap());
        assert_eq!(sp.try_take("b"), Some("x"));
    }

    #[tokio::test]
    async fn exist_any_times_out_when_all_empty() {
        let sp: Space<&str> = Space::new();
        assert!(!sp.exist_any(&["a", "b"], Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_drained_unblocks_when_last_entry_leaves() {
        let sp = Arc::new(Space::new());
        sp.out("k", "x");
        let drained = {
            let sp = Arc::clone(&sp);
            tokio::spawn(async move { sp.wait_drained_timeout("k", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sp.try_take("k"), Some("x"));
        assert!(drained.await.unwrap());
    }

    #[tokio::test]
    async fn listener_fires_on_out_with_key_and_value() {
        let sp: Space<&str> = Space::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let listener: Arc<dyn SpaceListener<&str>> = {
            let hits = Arc::clone(&hits);
            Arc::new(move |key: &str, value: &&str| {
                assert_eq!(key, "k");
                assert_eq!(*value, "v");
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        sp.add_listener("k", Arc::clone(&listener));
        sp.out("k", "v");
        sp.push("k", "v");
        sp.out("other", "v2");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        sp.remove_listener("k", &listener);
        sp.out("k", "v");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn listener_with_ttl_stops_firing_after_lease() {
        let sp: Space<&str> = Space::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let listener: Arc<dyn SpaceListener<&str>> = {
            let hits = Arc::clone(&hits);
            Arc::new(move |_: &str, _: &&str| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        sp.add_listener_ttl("k", listener, Duration::from_millis(30));
        sp.out("k", "v");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        sp.out("k", "v");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // The expired registration does not keep the slot alive either.
        assert_eq!(sp.try_take("k"), Some("v"));
        assert_eq!(sp.try_take("k"), Some("v"));
        assert_eq!(sp.try_take("k"), None);
        sp.gc();
        assert!(sp.keys().is_empty());
    }

    #[tokio::test]
    async fn gc_sweeps_expired_entries_and_empty_keys() {
        let sp = Space::new();
        sp.out_ttl("a", 1u8, Duration::from_millis(10));
        sp.out("b", 2u8);
        tokio::time::sleep(Duration::from_millis(25)).await;
        sp.gc();
        assert_eq!(sp.keys(), vec!["b".to_string()]);
        assert_eq!(sp.size("a"), 0);
        assert_eq!(sp.size("b"), 1);
    }

    #[tokio::test]
    async fn take_timeout_expiry_has_no_side_effects() {
        let sp: Space<&str> = Space::new();
        assert_eq!(sp.take_timeout("k", Duration::from_millis(30)).await, None);
        sp.out("k", "later");
        assert_eq!(sp.try_take("k"), Some("later"));
    }
}

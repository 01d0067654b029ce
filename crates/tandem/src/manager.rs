//! The participant-pipeline transaction manager.
//!
//! A manager runs a bounded pool of worker sessions against one input queue
//! on a [`Space`]. Each session takes a [`Context`], assigns it the next
//! monotonic id, and drives it through the configured participants:
//!
//! ```text
//! DEQUEUED -> PREPARING -> {PREPARING_FOR_ABORT} -> {COMMITTING | ABORTING} -> DONE
//!                 |
//!                 v
//!              PAUSED -> (resume) -> PREPARING
//!                     -> (expiry) -> ABORTING
//! ```
//!
//! The `head` counter is the next id to assign; `tail` is the oldest id not
//! yet resolved and only advances across a contiguous prefix of DONE ids, so
//! a crash can never silently skip an unresolved transaction. Both counters
//! and a persistent-subset snapshot of every in-flight Context go through
//! the [`RecoveryStore`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::error::{ConfigError, ManagerError};
use crate::participant::{Participant, Verdict};
use crate::paused::{PausedTransaction, PipelineRun};
use crate::recover::{MemoryRecoveryStore, RecoveryStore};
use crate::space::Space;

/// Context attribute naming additional participant groups for a run: a JSON
/// array of group names, honored in the order given.
pub const GROUPS_ATTR: &str = "tandem.groups";

const HEAD_COUNTER: &str = "head";
const TAIL_COUNTER: &str = "tail";

/// What to do with persisted in-flight snapshots found at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Re-enqueue every unresolved snapshot on the input queue. The replay
    /// gets a fresh id.
    #[default]
    Requeue,
    /// Log and delete unresolved snapshots.
    Discard,
}

/// Builder for a [`TransactionManager`]. Misconfiguration is fatal at
/// [`ManagerBuilder::build`]; the service refuses to start.
pub struct ManagerBuilder {
    space: Arc<Space<Context>>,
    queue: String,
    participants: Vec<Arc<dyn Participant>>,
    groups: HashMap<String, Vec<Arc<dyn Participant>>>,
    sessions: usize,
    retry_delay: Duration,
    pause_ttl: Duration,
    policy: RecoveryPolicy,
    store: Arc<dyn RecoveryStore>,
}

impl ManagerBuilder {
    pub fn new(space: Arc<Space<Context>>, queue: impl Into<String>) -> Self {
        Self {
            space,
            queue: queue.into(),
            participants: Vec::new(),
            groups: HashMap::new(),
            sessions: 4,
            retry_delay: Duration::from_secs(5),
            pause_ttl: Duration::from_secs(30),
            policy: RecoveryPolicy::default(),
            store: Arc::new(MemoryRecoveryStore::new()),
        }
    }

    /// Append a participant to the default list (always runs, in order).
    pub fn with_participant(mut self, participant: impl Participant + 'static) -> Self {
        self.participants.push(Arc::new(participant));
        self
    }

    /// Append an already-shared participant to the default list.
    pub fn with_shared_participant(mut self, participant: Arc<dyn Participant>) -> Self {
        self.participants.push(participant);
        self
    }

    /// Define a named group; a Context opts in via [`GROUPS_ATTR`].
    pub fn with_group(mut self, name: impl Into<String>, members: Vec<Arc<dyn Participant>>) -> Self {
        self.groups.insert(name.into(), members);
        self
    }

    /// Size of the worker-session pool.
    pub fn with_sessions(mut self, sessions: usize) -> Self {
        self.sessions = sessions;
        self
    }

    /// Delay before a RETRY attempt is re-enqueued.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// How long a paused transaction may wait for `resume` before it is
    /// force-aborted.
    pub fn with_pause_ttl(mut self, ttl: Duration) -> Self {
        self.pause_ttl = ttl;
        self
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecoveryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn build(self) -> Result<TransactionManager, ConfigError> {
        if self.queue.is_empty() {
            return Err(ConfigError::MissingQueue);
        }
        if self.participants.is_empty() && self.groups.values().all(|g| g.is_empty()) {
            return Err(ConfigError::NoParticipants);
        }
        if self.sessions == 0 {
            return Err(ConfigError::InvalidPoolSize(self.sessions));
        }
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|me: &Weak<ManagerInner>| ManagerInner {
            me: me.clone(),
            space: self.space,
            queue: self.queue,
            participants: self.participants,
            groups: self.groups,
            sessions: self.sessions,
            retry_delay: self.retry_delay,
            pause_ttl: self.pause_ttl,
            policy: self.policy,
            store: self.store,
            head: AtomicU64::new(1),
            head_persisted: Mutex::new(0),
            tail: Mutex::new(TailCursor {
                tail: 1,
                done: BTreeSet::new(),
            }),
            paused: DashMap::new(),
            resume_tx,
            resume_rx: Mutex::new(resume_rx),
            shutdown: watch::Sender::new(false),
        });
        Ok(TransactionManager { inner })
    }
}

struct TailCursor {
    /// Oldest id not yet resolved.
    tail: u64,
    /// Resolved ids above `tail`, waiting for the gap to close.
    done: BTreeSet<u64>,
}

struct ManagerInner {
    me: Weak<ManagerInner>,
    space: Arc<Space<Context>>,
    queue: String,
    participants: Vec<Arc<dyn Participant>>,
    groups: HashMap<String, Vec<Arc<dyn Participant>>>,
    sessions: usize,
    retry_delay: Duration,
    pause_ttl: Duration,
    policy: RecoveryPolicy,
    store: Arc<dyn RecoveryStore>,
    /// Next id to assign.
    head: AtomicU64,
    /// Highest head value written to the store; persists are serialized
    /// through this lock so a slow session cannot regress the counter.
    head_persisted: Mutex<u64>,
    tail: Mutex<TailCursor>,
    paused: DashMap<u64, PausedTransaction>,
    resume_tx: mpsc::UnboundedSender<PipelineRun>,
    resume_rx: Mutex<mpsc::UnboundedReceiver<PipelineRun>>,
    shutdown: watch::Sender<bool>,
}

/// Handle over the running session pool. Dropping it does not stop the
/// sessions; call [`ManagerHandle::shutdown`].
pub struct ManagerHandle {
    sessions: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl ManagerHandle {
    /// Signal every session to stop and wait for in-flight transactions to
    /// finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.sessions {
            let _ = handle.await;
        }
    }
}

/// The transaction manager. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("queue", &self.inner.queue)
            .field("sessions", &self.inner.sessions)
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    pub fn builder(space: Arc<Space<Context>>, queue: impl Into<String>) -> ManagerBuilder {
        ManagerBuilder::new(space, queue)
    }

    /// Run recovery and start the session pool.
    pub async fn start(&self) -> Result<ManagerHandle, ManagerError> {
        self.inner.recover().await?;
        let mut sessions = Vec::with_capacity(self.inner.sessions);
        for n in 0..self.inner.sessions {
            // Subscribe before spawning: a receiver created after
            // `shutdown.send(true)` would treat the value as already seen
            // and the session would never observe the signal.
            let shutdown = self.inner.shutdown.subscribe();
            sessions.push(tokio::spawn(Arc::clone(&self.inner).session(n, shutdown)));
        }
        info!(
            queue = %self.inner.queue,
            sessions = self.inner.sessions,
            "transaction manager started"
        );
        Ok(ManagerHandle {
            sessions,
            shutdown: self.inner.shutdown.clone(),
        })
    }

    /// Re-submit a paused transaction's continuation to the worker pool,
    /// cancelling its expiry timer.
    pub fn resume(&self, id: u64) -> Result<(), ManagerError> {
        let (_, paused) = self
            .inner
            .paused
            .remove(&id)
            .ok_or(ManagerError::NotPaused(id))?;
        paused.timer.abort();
        paused.run.ctx.checkpoint("resumed");
        info!(id, "transaction resumed");
        self.inner
            .resume_tx
            .send(paused.run)
            .map_err(|_| ManagerError::ShutDown)
    }

    /// Ids currently parked in PAUSED state.
    pub fn paused_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.paused.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Next id to assign.
    pub fn head(&self) -> u64 {
        self.inner.head.load(Ordering::SeqCst)
    }

    /// Oldest id not yet resolved.
    pub async fn tail(&self) -> u64 {
        self.inner.tail.lock().await.tail
    }
}

impl ManagerInner {
    async fn recover(&self) -> Result<(), ManagerError> {
        let head = self.store.get_counter(HEAD_COUNTER).await?.unwrap_or(1);
        self.head.store(head, Ordering::SeqCst);
        *self.head_persisted.lock().await = head;

        let ids = self.store.snapshot_ids().await?;
        for id in ids {
            match self.policy {
                RecoveryPolicy::Requeue => {
                    if let Some(snapshot) = self.store.get_snapshot(id).await? {
                        self.store.delete_snapshot(id).await?;
                        warn!(id, "requeueing unresolved transaction");
                        self.space.out(&self.queue, Context::from_snapshot(&snapshot));
                    }
                }
                RecoveryPolicy::Discard => {
                    self.store.delete_snapshot(id).await?;
                    warn!(id, "discarding unresolved transaction");
                }
            }
        }

        // Every pre-restart id is now accounted for.
        let mut cursor = self.tail.lock().await;
        cursor.tail = head;
        cursor.done.clear();
        self.store.put_counter(TAIL_COUNTER, head).await?;
        Ok(())
    }

    async fn session(self: Arc<Self>, n: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                stopped = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => {
                    if stopped {
                        break;
                    }
                }
                run = self.next_resume() => {
                    self.drive(run).await;
                }
                ctx = self.space.take(&self.queue) => {
                    self.begin(ctx).await;
                }
            }
        }
        info!(session = n, "session stopped");
    }

    /// One session at a time parks here; `recv` is cancel-safe, so losing
    /// the select race drops no continuation.
    async fn next_resume(&self) -> PipelineRun {
        let mut rx = self.resume_rx.lock().await;
        loop {
            if let Some(run) = rx.recv().await {
                return run;
            }
        }
    }

    async fn begin(&self, ctx: Context) {
        let id = self.head.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.persist_head(id + 1).await {
            error!(id, error = %e, "failed to persist head counter, re-enqueueing");
            self.schedule_retry(ctx);
            self.finish(id).await;
            return;
        }
        if let Err(e) = self.store.put_snapshot(id, ctx.to_snapshot()).await {
            error!(id, error = %e, "failed to persist context snapshot, re-enqueueing");
            self.schedule_retry(ctx);
            self.finish(id).await;
            return;
        }
        ctx.checkpoint("dequeued");
        info!(id, queue = %self.queue, "transaction dequeued");
        let participants = self.select_participants(&ctx);
        self.drive(PipelineRun::new(id, participants, ctx)).await;
    }

    /// Persist the head counter, skipping writes that would regress it.
    /// Sessions race from `fetch_add` to here; the lock orders the store
    /// writes and the max check drops the stale ones.
    async fn persist_head(&self, value: u64) -> anyhow::Result<()> {
        let mut persisted = self.head_persisted.lock().await;
        if value > *persisted {
            self.store.put_counter(HEAD_COUNTER, value).await?;
            *persisted = value;
        }
        Ok(())
    }

    /// The default list always runs; groups named by the Context are
    /// appended in the order given.
    fn select_participants(&self, ctx: &Context) -> Vec<Arc<dyn Participant>> {
        let mut selected = self.participants.clone();
        if let Some(Value::Array(names)) = ctx.get(GROUPS_ATTR) {
            for name in names {
                let Some(name) = name.as_str() else { continue };
                match self.groups.get(name) {
                    Some(members) => selected.extend(members.iter().cloned()),
                    None => warn!(group = name, "unknown participant group requested"),
                }
            }
        }
        selected
    }

    /// The pipeline driver. Resumable: a paused run re-enters here at its
    /// saved cursor with its saved members and aborting flag.
    async fn drive(&self, mut run: PipelineRun) {
        while run.cursor < run.participants.len() {
            let participant = Arc::clone(&run.participants[run.cursor]);

            if run.aborting {
                match participant.prepare_for_abort(run.id, &run.ctx).await {
                    Ok(verdict) => {
                        if verdict.joins() {
                            run.members.push(run.cursor);
                        }
                    }
                    Err(e) => {
                        error!(
                            id = run.id,
                            participant = participant.name(),
                            error = %e,
                            "prepare_for_abort failed"
                        );
                    }
                }
                run.cursor += 1;
                continue;
            }

            let verdict = match participant.prepare(run.id, &run.ctx).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!(
                        id = run.id,
                        participant = participant.name(),
                        error = %e,
                        "prepare failed, counting as ABORTED"
                    );
                    Verdict::ABORTED
                }
            };

            if verdict.contains(Verdict::RETRY) {
                info!(
                    id = run.id,
                    participant = participant.name(),
                    delay = ?self.retry_delay,
                    "retry requested, re-enqueueing"
                );
                run.ctx.checkpoint("retry");
                self.abort_members(&run).await;
                self.schedule_retry(run.ctx.clone());
                self.finish(run.id).await;
                return;
            }

            if verdict.contains(Verdict::PAUSE) {
                if verdict.joins() {
                    run.members.push(run.cursor);
                }
                run.cursor += 1;
                self.pause(run).await;
                return;
            }

            if verdict.contains(Verdict::ABORTED) {
                warn!(
                    id = run.id,
                    participant = participant.name(),
                    "participant voted to abort"
                );
                run.aborting = true;
            } else if verdict.joins() {
                run.members.push(run.cursor);
            }
            run.cursor += 1;
        }

        if run.aborting {
            self.abort_members(&run).await;
            run.ctx.checkpoint("aborted");
            info!(id = run.id, "transaction aborted");
        } else {
            for &idx in &run.members {
                let member = &run.participants[idx];
                if let Err(e) = member.commit(run.id, &run.ctx).await {
                    error!(
                        id = run.id,
                        participant = member.name(),
                        error = %e,
                        "commit failed"
                    );
                }
            }
            run.ctx.checkpoint("committed");
            info!(id = run.id, "transaction committed");
        }
        self.finish(run.id).await;
    }

    /// Abort every joined member in reverse prepare order. Failures are
    /// logged and never stop the remaining members.
    async fn abort_members(&self, run: &PipelineRun) {
        for &idx in run.members.iter().rev() {
            let member = &run.participants[idx];
            if let Err(e) = member.abort(run.id, &run.ctx).await {
                error!(
                    id = run.id,
                    participant = member.name(),
                    error = %e,
                    "abort failed"
                );
            }
        }
    }

    fn schedule_retry(&self, ctx: Context) {
        let space = Arc::clone(&self.space);
        let queue = self.queue.clone();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            space.out(&queue, ctx);
        });
    }

    /// Park the run and release this worker back to the pool.
    async fn pause(&self, run: PipelineRun) {
        let id = run.id;
        run.ctx.checkpoint("paused");
        // Refresh the snapshot so a crash during the pause keeps progress.
        if let Err(e) = self.store.put_snapshot(id, run.ctx.to_snapshot()).await {
            error!(id, error = %e, "failed to persist paused snapshot");
        }
        let timer = {
            let me = self.me.upgrade().expect("manager alive while pausing");
            tokio::spawn(async move {
                tokio::time::sleep(me.pause_ttl).await;
                me.expire(id).await;
            })
        };
        info!(id, ttl = ?self.pause_ttl, "transaction paused");
        self.paused.insert(id, PausedTransaction { run, timer });
    }

    /// Pause-expiry path: force-abort the captured members.
    async fn expire(&self, id: u64) {
        let Some((_, paused)) = self.paused.remove(&id) else {
            return;
        };
        warn!(id, "pause expired before resume, forcing abort");
        let run = paused.run;
        self.abort_members(&run).await;
        run.ctx.checkpoint("expired");
        self.finish(id).await;
    }

    /// Mark `id` DONE and advance `tail` across the contiguous done prefix.
    ///
    /// The persist happens under the cursor lock so concurrent sessions
    /// cannot overwrite a higher persisted tail with a stale lower one.
    async fn finish(&self, id: u64) {
        {
            let mut cursor = self.tail.lock().await;
            cursor.done.insert(id);
            loop {
                let tail = cursor.tail;
                if !cursor.done.remove(&tail) {
                    break;
                }
                cursor.tail += 1;
            }
            let tail = cursor.tail;
            if let Err(e) = self.store.put_counter(TAIL_COUNTER, tail).await {
                error!(id, error = %e, "failed to persist tail counter");
            }
        }
        if let Err(e) = self.store.delete_snapshot(id).await {
            error!(id, error = %e, "failed to delete snapshot");
        }
    }
}

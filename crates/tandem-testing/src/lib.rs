//! Testing utilities for Tandem pipelines.
//!
//! Application test suites need two things over and over: participants whose
//! behavior is scripted per attempt, and a shared log of every participant
//! call to assert ordering against. This crate provides both, plus a couple
//! of small async helpers.
//!
//! # Example
//!
//! ```ignore
//! use tandem_testing::{CallLog, ScriptedParticipant};
//! use tandem_core::{Space, TransactionManager, Verdict};
//!
//! let log = CallLog::new();
//! let tm = TransactionManager::builder(space, "txn")
//!     .with_shared_participant(ScriptedParticipant::new("auth", &log)
//!         .then(Verdict::RETRY)
//!         .then(Verdict::PREPARED)
//!         .into_shared())
//!     .build()?;
//! // ...
//! assert_eq!(log.of("auth"), vec!["auth:prepare", "auth:prepare", "auth:commit"]);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tandem_core::{Context, Participant, Verdict};
use uuid::Uuid;

/// Shared, cloneable log of participant calls in `"name:call"` form.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str, call: &str) {
        self.calls.lock().unwrap().push(format!("{name}:{call}"));
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls of one participant only, in order.
    pub fn of(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}:");
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Step {
    Respond(Verdict),
    Fail(String),
}

/// A participant whose `prepare` answers are scripted per attempt.
///
/// Each `prepare` call consumes the next step; once the script is exhausted
/// the last step repeats (an empty script answers PREPARED). All calls are
/// recorded into the [`CallLog`].
pub struct ScriptedParticipant {
    name: String,
    script: Mutex<VecDeque<Step>>,
    abort_verdict: Verdict,
    log: CallLog,
}

impl ScriptedParticipant {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            abort_verdict: Verdict::PREPARED | Verdict::NO_JOIN,
            log: log.clone(),
        }
    }

    /// Append a verdict to the prepare script.
    pub fn then(self, verdict: Verdict) -> Self {
        self.script.lock().unwrap().push_back(Step::Respond(verdict));
        self
    }

    /// Append a failing attempt to the prepare script.
    pub fn then_fail(self, reason: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Step::Fail(reason.to_string()));
        self
    }

    /// What `prepare_for_abort` answers (defaults to PREPARED | NO_JOIN).
    pub fn on_abort(mut self, verdict: Verdict) -> Self {
        self.abort_verdict = verdict;
        self
    }

    pub fn into_shared(self) -> Arc<dyn Participant> {
        Arc::new(self)
    }
}

#[async_trait]
impl Participant for ScriptedParticipant {
    async fn prepare(&self, _id: u64, _ctx: &Context) -> anyhow::Result<Verdict> {
        self.log.record(&self.name, "prepare");
        let mut script = self.script.lock().unwrap();
        let step = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().map(|s| match s {
                Step::Respond(v) => Step::Respond(*v),
                Step::Fail(r) => Step::Fail(r.clone()),
            })
        };
        match step {
            Some(Step::Respond(v)) => Ok(v),
            Some(Step::Fail(reason)) => Err(anyhow!(reason)),
            None => Ok(Verdict::PREPARED),
        }
    }

    async fn prepare_for_abort(&self, _id: u64, _ctx: &Context) -> anyhow::Result<Verdict> {
        self.log.record(&self.name, "prepare_for_abort");
        Ok(self.abort_verdict)
    }

    async fn commit(&self, _id: u64, _ctx: &Context) -> anyhow::Result<()> {
        self.log.record(&self.name, "commit");
        Ok(())
    }

    async fn abort(&self, _id: u64, _ctx: &Context) -> anyhow::Result<()> {
        self.log.record(&self.name, "abort");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A participant that always answers the same verdict and records its calls.
pub struct RecordingParticipant {
    name: String,
    verdict: Verdict,
    log: CallLog,
}

impl RecordingParticipant {
    pub fn new(name: &str, verdict: Verdict, log: &CallLog) -> Arc<dyn Participant> {
        Arc::new(Self {
            name: name.to_string(),
            verdict,
            log: log.clone(),
        })
    }
}

#[async_trait]
impl Participant for RecordingParticipant {
    async fn prepare(&self, _id: u64, _ctx: &Context) -> anyhow::Result<Verdict> {
        self.log.record(&self.name, "prepare");
        Ok(self.verdict)
    }

    async fn prepare_for_abort(&self, _id: u64, _ctx: &Context) -> anyhow::Result<Verdict> {
        self.log.record(&self.name, "prepare_for_abort");
        Ok(Verdict::PREPARED | Verdict::NO_JOIN)
    }

    async fn commit(&self, _id: u64, _ctx: &Context) -> anyhow::Result<()> {
        self.log.record(&self.name, "commit");
        Ok(())
    }

    async fn abort(&self, _id: u64, _ctx: &Context) -> anyhow::Result<()> {
        self.log.record(&self.name, "abort");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A Context pre-tagged with a unique correlation id under `"test.corr"`,
/// handy when asserting which enqueued Context produced which calls.
pub fn tagged_context() -> (Context, String) {
    let corr = Uuid::new_v4().to_string();
    let ctx = Context::new();
    ctx.put_persistent("test.corr", serde_json::json!(corr.clone()));
    (ctx, corr)
}

/// Poll `cond` every 5ms until it holds, panicking after `timeout`.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

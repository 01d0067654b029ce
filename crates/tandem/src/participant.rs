//! One stage of a transaction pipeline.
//!
//! Participants are plain value types holding their own configuration; the
//! manager drives them strictly in the configured order, one transaction id
//! at a time per worker session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::Context;

/// The bitmask a participant returns from `prepare`/`prepare_for_abort`.
///
/// Exactly one of [`Verdict::PREPARED`] / [`Verdict::ABORTED`] combined with
/// zero or more modifiers.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict(u8);

impl Verdict {
    /// Forward work done; willing to commit.
    pub const PREPARED: Verdict = Verdict(0x01);
    /// Vote to abort the transaction.
    pub const ABORTED: Verdict = Verdict(0x02);
    /// Discard this attempt and re-enqueue the Context after the manager's
    /// retry delay. The participant alone bounds its retry count.
    pub const RETRY: Verdict = Verdict(0x04);
    /// Suspend the run pending an external event; the worker is released.
    pub const PAUSE: Verdict = Verdict(0x08);
    /// Do not call `commit`/`abort` on this participant later.
    pub const NO_JOIN: Verdict = Verdict(0x10);
    /// No commit/abort needed; equivalent to NO_JOIN for resource purposes.
    pub const READONLY: Verdict = Verdict(0x20);

    pub fn contains(self, flags: Verdict) -> bool {
        self.0 & flags.0 == flags.0
    }

    /// Whether this verdict enrolls the participant in the members list
    /// (i.e. it will later receive `commit` or `abort`).
    pub fn joins(self) -> bool {
        self.contains(Verdict::PREPARED)
            && !self.contains(Verdict::NO_JOIN)
            && !self.contains(Verdict::READONLY)
    }
}

impl std::ops::BitOr for Verdict {
    type Output = Verdict;

    fn bitor(self, rhs: Verdict) -> Verdict {
        Verdict(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Verdict::PREPARED, "PREPARED"),
            (Verdict::ABORTED, "ABORTED"),
            (Verdict::RETRY, "RETRY"),
            (Verdict::PAUSE, "PAUSE"),
            (Verdict::NO_JOIN, "NO_JOIN"),
            (Verdict::READONLY, "READONLY"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "EMPTY")?;
        }
        Ok(())
    }
}

/// A unit of pipeline logic.
///
/// Errors returned from `prepare`/`prepare_for_abort` are caught by the
/// manager, logged with the transaction id, and counted as an abort vote for
/// this participant only; errors from `commit`/`abort` are caught and logged
/// without stopping the remaining members of the same pass.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Do forward work for transaction `id` and vote on its outcome.
    async fn prepare(&self, id: u64, ctx: &Context) -> anyhow::Result<Verdict>;

    /// Called instead of `prepare` once an earlier participant has voted
    /// ABORTED, giving later participants a chance to react without doing
    /// forward work. Returning PREPARED without NO_JOIN enrolls this
    /// participant for the `abort` call.
    async fn prepare_for_abort(&self, _id: u64, _ctx: &Context) -> anyhow::Result<Verdict> {
        Ok(Verdict::PREPARED | Verdict::NO_JOIN)
    }

    /// Make the prepared work durable.
    async fn commit(&self, _id: u64, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Undo the prepared work.
    async fn abort(&self, _id: u64, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stable name used in logs.
    fn name(&self) -> &str {
        "participant"
    }
}

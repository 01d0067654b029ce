//! Suspended pipeline runs.
//!
//! A pipeline run is an explicit state machine, not a parked thread: the
//! driver loop advances a cursor over an ordered participant list, and a
//! PAUSE verdict freezes the whole run state into a [`PausedTransaction`]
//! that survives a worker-pool hand-off. Resuming re-enters the driver at
//! the saved cursor with the saved members and aborting flag.

use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::participant::Participant;

/// The live state of one pipeline run.
///
/// `members` holds indices into `participants` so the continuation stays
/// serializable; the `Arc`s themselves are process-local.
pub struct PipelineRun {
    pub id: u64,
    pub ctx: Context,
    /// Index of the next participant to drive.
    pub cursor: usize,
    /// Participants that joined (will receive `commit` or `abort`), as
    /// indices into `participants`, in prepare order.
    pub members: Vec<usize>,
    /// Once set, the remaining participants see `prepare_for_abort` and the
    /// run ends in the abort pass.
    pub aborting: bool,
    pub participants: Vec<Arc<dyn Participant>>,
}

impl PipelineRun {
    pub fn new(id: u64, participants: Vec<Arc<dyn Participant>>, ctx: Context) -> Self {
        Self {
            id,
            ctx,
            cursor: 0,
            members: Vec::new(),
            aborting: false,
            participants,
        }
    }
}

impl std::fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRun")
            .field("id", &self.id)
            .field("cursor", &self.cursor)
            .field("members", &self.members)
            .field("aborting", &self.aborting)
            .field("participants", &self.participants.len())
            .finish()
    }
}

/// A captured continuation, owned by the manager from PAUSE until resume or
/// forced-expiry abort.
pub struct PausedTransaction {
    pub run: PipelineRun,
    /// Expiry timer; aborted on resume. Firing is the only mechanism that
    /// force-aborts a run without participant action.
    pub timer: JoinHandle<()>,
}

impl Serialize for PausedTransaction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("PausedTransaction", 5)?;
        s.serialize_field("id", &self.run.id)?;
        s.serialize_field("cursor", &self.run.cursor)?;
        s.serialize_field("members", &self.run.members)?;
        s.serialize_field("aborting", &self.run.aborting)?;
        s.serialize_field("context", &self.run.ctx)?;
        s.end()
    }
}

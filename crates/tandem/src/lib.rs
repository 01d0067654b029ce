//! # Tandem
//!
//! Transaction middleware built around two tightly coupled engines: a
//! tuple-space coordination primitive and a participant-pipeline transaction
//! manager running on top of it.
//!
//! ## Core Concepts
//!
//! - [`Space`] — a keyed, blocking, lease-aware multiset. Producers `out`
//!   values under a key, consumers probe or block for them, entries may
//!   carry a lease and vanish when it expires.
//! - [`Context`] — the unit of work: a serializable attribute bag with a
//!   volatile/persistent split and a built-in blocking result slot.
//! - [`Participant`] — one stage of pipeline logic exposing
//!   `prepare` / `prepare_for_abort` / `commit` / `abort`.
//! - [`TransactionManager`] — a bounded pool of worker sessions that dequeue
//!   Contexts, assign monotonic ids, drive the participant pipeline and
//!   persist recovery checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! Producer ── out(queue, ctx) ──► Space ◄── take(queue) ── Session pool
//!     │                                                        │
//!     │ ctx.get_wait(result)                                   ▼
//!     ◄─────────────────────────────────────── prepare ► commit / abort
//!                                                   │
//!                                                PAUSED ── resume / expiry
//! ```
//!
//! ## Key Invariants
//!
//! 1. Entries under one key keep FIFO (`out`) or LIFO (`push`) order; they
//!    are never reordered except by removal.
//! 2. Wakeup is broadcast; destructive readers re-check and exactly one
//!    removes each entry.
//! 3. Within one transaction id, participant calls are strictly sequential
//!    in configured order.
//! 4. `tail` never advances past an unresolved transaction id.
//! 5. Only the persistent subset of a Context crosses a pause/resume or
//!    crash boundary.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tandem_core::{Context, Space, TransactionManager};
//!
//! let space = Arc::new(Space::new());
//! let tm = TransactionManager::builder(Arc::clone(&space), "txn")
//!     .with_participant(ValidateCard::default())
//!     .with_participant(AuthorizeAmount::default())
//!     .with_sessions(8)
//!     .build()?;
//! let handle = tm.start().await?;
//!
//! let ctx = Context::new();
//! ctx.put_persistent("amount", serde_json::json!(250));
//! space.out("txn", ctx.clone());
//!
//! let outcome = ctx.get_wait("response", std::time::Duration::from_secs(5)).await;
//! ```

mod context;
mod error;
mod manager;
mod participant;
mod paused;
mod recover;
mod registry;
mod space;


pub use context::{Checkpoint, Context};
pub use error::{ConfigError, ManagerError};
pub use manager::{
    ManagerBuilder, ManagerHandle, RecoveryPolicy, TransactionManager, GROUPS_ATTR,
};
pub use participant::{Participant, Verdict};
pub use paused::{PausedTransaction, PipelineRun};
pub use recover::{MemoryRecoveryStore, RecoveryStore};
pub use registry::SpaceRegistry;
pub use space::{Space, SpaceListener, Template};

// Re-export commonly used external types
pub use async_trait::async_trait;

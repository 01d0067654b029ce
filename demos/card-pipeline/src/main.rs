//! # Card Pipeline Demo
//!
//! A minimal authorization pipeline: validate the card number, screen the
//! amount against a limit, then authorize and publish the response into the
//! Context's result slot. The producer blocks on `get_wait` exactly as a
//! real caller would.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tandem_core::{Context, Participant, Space, TransactionManager, Verdict};

// ============================================================================
// Participants
// ============================================================================

/// Rejects contexts without a plausible card number.
struct ValidateCard;

#[async_trait]
impl Participant for ValidateCard {
    async fn prepare(&self, _id: u64, ctx: &Context) -> Result<Verdict> {
        let pan = ctx.get_or("pan", json!("")).as_str().unwrap_or("").to_string();
        if pan.len() >= 12 && pan.chars().all(|c| c.is_ascii_digit()) {
            Ok(Verdict::PREPARED | Verdict::READONLY)
        } else {
            ctx.put("response", json!({"approved": false, "reason": "invalid card"}));
            Ok(Verdict::ABORTED)
        }
    }

    fn name(&self) -> &str {
        "validate-card"
    }
}

/// Votes to abort anything over the floor limit.
struct CheckLimit {
    floor: u64,
}

#[async_trait]
impl Participant for CheckLimit {
    async fn prepare(&self, _id: u64, ctx: &Context) -> Result<Verdict> {
        let amount = ctx.get_or("amount", json!(0)).as_u64().unwrap_or(0);
        if amount > self.floor {
            ctx.put("response", json!({"approved": false, "reason": "over limit"}));
            return Ok(Verdict::ABORTED);
        }
        Ok(Verdict::PREPARED)
    }

    async fn abort(&self, id: u64, _ctx: &Context) -> Result<()> {
        println!("  limit reservation released for txn {id}");
        Ok(())
    }

    fn name(&self) -> &str {
        "check-limit"
    }
}

/// Issues the approval and publishes the result.
struct Authorize;

#[async_trait]
impl Participant for Authorize {
    async fn prepare(&self, id: u64, ctx: &Context) -> Result<Verdict> {
        ctx.put_persistent("auth_code", json!(format!("A{id:06}")));
        Ok(Verdict::PREPARED)
    }

    async fn commit(&self, _id: u64, ctx: &Context) -> Result<()> {
        let code = ctx.get_or("auth_code", json!(null));
        ctx.put("response", json!({"approved": true, "auth_code": code}));
        Ok(())
    }

    fn name(&self) -> &str {
        "authorize"
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let space = Arc::new(Space::new());
    let tm = TransactionManager::builder(Arc::clone(&space), "txn")
        .with_participant(ValidateCard)
        .with_participant(CheckLimit { floor: 500 })
        .with_participant(Authorize)
        .with_sessions(4)
        .build()?;
    let handle = tm.start().await?;

    let requests = [
        ("4111111111111111", 120u64),
        ("4111111111111111", 900),
        ("not-a-card", 50),
    ];

    for (pan, amount) in requests {
        let ctx = Context::new();
        ctx.put_persistent("pan", json!(pan));
        ctx.put_persistent("amount", json!(amount));
        space.out("txn", ctx.clone());

        let response = ctx
            .get_wait("response", Duration::from_secs(5))
            .await
            .unwrap_or(json!({"approved": false, "reason": "timeout"}));
        println!("pan={pan} amount={amount} -> {response}");
    }

    handle.shutdown().await;
    Ok(())
}

//! Simulated request pipeline
//!
//! A request handler that decodes a message, then stores it, with every
//! step traced. The `calltrace` binary runs it to show what a report looks
//! like; tests use it as a realistic multi-function workload.
//!
//! Each step is its own non-inlined function so that attribution names the
//! step even in optimized builds.

use crate::context::{fetch, Context};
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// Request body used when none is given
pub const SAMPLE_BODY: &str = r#"title = "calltrace"
subtitle = "Simple, lightweight tracing mechanism."
"#;

/// The decoded request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub title: String,
    pub subtitle: String,
}

/// Handle one request: decode the body, then store it
///
/// `work` is the simulated cost of each step; storing costs ten times as
/// much.
#[inline(never)]
pub fn handle(ctx: &Context, request_id: &str, body: &str, work: Duration) -> Result<Message> {
    let call = fetch(ctx).start_with([request_id.to_string()]).stop_on_drop();

    thread::sleep(work);

    call.checkpoint_with(["serialize"]);
    let message = fetch_data(ctx, body, work)?;

    thread::sleep(work);

    call.checkpoint_with(["store"]);
    store(ctx, &message, work * 10)?;

    Ok(message)
}

/// Decode the request body
#[inline(never)]
pub fn fetch_data(ctx: &Context, body: &str, work: Duration) -> Result<Message> {
    let _call = fetch(ctx).start().stop_on_drop();

    thread::sleep(work);
    toml::from_str(body).context("Failed to decode request body")
}

/// Encode the message as if writing it to a database
#[inline(never)]
pub fn store(ctx: &Context, message: &Message, work: Duration) -> Result<usize> {
    let _call = fetch(ctx).start().stop_on_drop();

    thread::sleep(work);
    let encoded = toml::to_string(message).context("Failed to encode message")?;
    Ok(encoded.len())
}

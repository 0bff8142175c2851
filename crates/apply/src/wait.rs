//! Bounded polling of the live object after a mutation.

use std::time::Duration;

use konverge_core::{Error, Readiness, ResourceDocument, ResourceIdentity, Result};
use konverge_kubehub::{fetch, Transport};
use metrics::counter;
use tokio::time::Instant;
use tracing::debug;

pub enum WaitTarget<'a> {
    /// Object exists and the predicate holds.
    Ready(&'a Readiness),
    /// Object can no longer be read.
    Gone,
}

impl WaitTarget<'_> {
    fn label(&self) -> &'static str {
        match self {
            WaitTarget::Ready(_) => "ready",
            WaitTarget::Gone => "gone",
        }
    }
}

/// Poll until `target` is observed or `timeout` elapses.
///
/// Returns the last live document seen (`None` once gone). A fetch that would outlive the
/// deadline is cancelled, so the call never blocks longer than `timeout` plus one interval.
pub async fn wait_for(
    transport: &dyn Transport,
    id: &ResourceIdentity,
    target: WaitTarget<'_>,
    timeout: Duration,
    interval: Duration,
) -> Result<Option<ResourceDocument>> {
    let started = Instant::now();
    let deadline = started + timeout;
    let interval = interval.max(Duration::from_millis(1));
    loop {
        counter!("wait_polls_total", 1u64, "target" => target.label());
        let remaining = deadline.saturating_duration_since(Instant::now());
        let live = match tokio::time::timeout(remaining, fetch(transport, id)).await {
            Ok(res) => res?,
            Err(_) => return Err(Error::WaitTimeout { target: id.to_string(), waited: started.elapsed() }),
        };
        let reached = match (&target, &live) {
            (WaitTarget::Ready(ready), Some(doc)) => ready(doc),
            (WaitTarget::Gone, None) => true,
            _ => false,
        };
        if reached {
            debug!(target = %id, waited_ms = started.elapsed().as_millis() as u64, "wait: condition met");
            return Ok(live);
        }
        if Instant::now() >= deadline {
            return Err(Error::WaitTimeout { target: id.to_string(), waited: started.elapsed() });
        }
        let nap = interval.min(deadline.saturating_duration_since(Instant::now()));
        tokio::time::sleep(nap).await;
    }
}

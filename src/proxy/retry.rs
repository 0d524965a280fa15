//! Bounded retry loop around a single probe
//!
//! Terminal failures stop the sequence at once; retryable ones are attempted
//! again until the budget runs out. A probe that panics is recorded as an
//! unexpected, terminal failure. Every state change is written through the
//! registry so observers see per-attempt progress.

use crate::proxy::checker::{Probe, ProbeError, ProbeOutcome};
use crate::proxy::models::{Endpoint, ProbeState};
use crate::proxy::registry::{EntryId, Registry};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// Attempt budget and per-attempt timeout for one endpoint
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    timeout: Duration,
}

impl RetryPolicy {
    /// A budget of zero is treated as one attempt
    pub fn new(max_attempts: u32, timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drive attempts for the claimed entry `id` until success, a terminal
    /// failure or an exhausted budget, and return the final state
    pub async fn run<P: Probe + ?Sized>(
        &self,
        registry: &Registry,
        id: EntryId,
        endpoint: &Endpoint,
        probe: &P,
        target: &str,
    ) -> ProbeState {
        for attempt in 1..=self.max_attempts {
            registry.update_status(id, |status| {
                status.set_attempt(attempt);
                status.set_state(ProbeState::Testing);
            });

            tracing::debug!(endpoint = %endpoint, attempt, "probing");

            match self.attempt(probe, target, endpoint).await {
                Ok(latency_ms) => {
                    registry.update_status(id, |status| status.mark_ok(latency_ms));
                    tracing::debug!(endpoint = %endpoint, attempt, latency_ms, "probe succeeded");
                    return ProbeState::Ok;
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    tracing::debug!(
                        endpoint = %endpoint,
                        attempt,
                        retryable,
                        error = %err,
                        "probe failed"
                    );
                    registry.update_status(id, |status| status.mark_fail(err.to_string()));
                    if !retryable {
                        break;
                    }
                }
            }
        }

        ProbeState::Fail
    }

    async fn attempt<P: Probe + ?Sized>(
        &self,
        probe: &P,
        target: &str,
        endpoint: &Endpoint,
    ) -> ProbeOutcome {
        let call = probe.probe(target, endpoint, self.timeout);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(endpoint = %endpoint, %message, "probe panicked");
                Err(ProbeError::Unexpected(message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("probe panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("probe panicked: {}", s)
    } else {
        "probe panicked".to_string()
    }
}

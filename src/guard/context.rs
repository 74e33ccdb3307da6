//! Per-request budget state shared by every invocation in one request.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Default per-request call ceiling.
pub const DEFAULT_MAX_CALLS: u32 = 8;

/// Default per-request wall-clock ceiling in milliseconds.
pub const DEFAULT_MAX_DURATION_MS: u64 = 60_000;

/// A budget ceiling was breached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetBreach {
    /// The call counter passed its ceiling.
    #[error("tool call budget exhausted: call {made} of {max}")]
    Calls {
        /// Counter value after the rejected increment.
        made: u32,
        /// Configured ceiling.
        max: u32,
    },

    /// The request has been running longer than allowed.
    #[error("request duration budget exhausted: {elapsed_ms}ms of {max_ms}ms")]
    Duration {
        /// Elapsed wall-clock time since request start.
        elapsed_ms: u64,
        /// Configured ceiling.
        max_ms: u64,
    },
}

/// Mutable, request-scoped budget state.
///
/// Created at request start, shared by every invocation within the request,
/// discarded at request end. Budget numbers are per-context, so nothing here
/// coordinates across requests. The call counter uses an atomic so that
/// concurrent invocations racing past the check cannot exceed the ceiling.
#[derive(Debug)]
pub struct GuardContext {
    request_id: String,
    calls_made: AtomicU32,
    max_calls: u32,
    started_at: Instant,
    max_duration: Option<Duration>,
}

impl GuardContext {
    /// Create a context with an auto-generated request id.
    pub fn new(max_calls: u32, max_duration: Option<Duration>) -> Self {
        Self::with_request_id(Uuid::new_v4().to_string(), max_calls, max_duration)
    }

    /// Create a context with a caller-supplied request id.
    pub fn with_request_id(
        request_id: impl Into<String>,
        max_calls: u32,
        max_duration: Option<Duration>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            calls_made: AtomicU32::new(0),
            max_calls,
            started_at: Instant::now(),
            max_duration,
        }
    }

    /// Opaque identifier of the request this context belongs to.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Calls registered so far, including rejected over-budget ones.
    pub fn calls_made(&self) -> u32 {
        self.calls_made.load(Ordering::SeqCst)
    }

    /// Configured call ceiling.
    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    /// Wall-clock time since the request started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Atomically claim one call slot.
    ///
    /// The increment is a ratchet: it is never rolled back when the claim is
    /// rejected, so after the first rejection the counter sits one past the
    /// ceiling. The single fetch-add makes the increment-and-compare safe
    /// under concurrent claims from parallel invocations.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetBreach::Calls`] when the new count passes the ceiling.
    pub fn register_call(&self) -> Result<u32, BudgetBreach> {
        let made = self
            .calls_made
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        if made > self.max_calls {
            return Err(BudgetBreach::Calls {
                made,
                max: self.max_calls,
            });
        }
        Ok(made)
    }

    /// Check the wall-clock ceiling, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetBreach::Duration`] when the request has been running
    /// longer than `max_duration`.
    pub fn check_duration(&self) -> Result<(), BudgetBreach> {
        let Some(max) = self.max_duration else {
            return Ok(());
        };
        let elapsed = self.started_at.elapsed();
        if elapsed > max {
            return Err(BudgetBreach::Duration {
                elapsed_ms: clamp_millis(elapsed),
                max_ms: clamp_millis(max),
            });
        }
        Ok(())
    }
}

impl Default for GuardContext {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_CALLS,
            Some(Duration::from_millis(DEFAULT_MAX_DURATION_MS)),
        )
    }
}

/// Convert a duration to whole milliseconds, saturating on overflow.
fn clamp_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

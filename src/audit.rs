//! Audit events and append-only sinks.
//!
//! The guard pipeline is the sole producer of [`AuditEvent`]s; sinks are
//! passive consumers. Each event serializes to a single flat JSON object
//! (`type`, `request_id`, `timestamp` in epoch milliseconds, plus
//! kind-specific fields), one object per line — safe to tail. Sink failures
//! never abort the guarded call; the pipeline logs them and moves on.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// One audit record covering a single stage of a guarded tool invocation.
///
/// Immutable once constructed. Within one invocation the order is fixed:
/// `attempted` first, then exactly one terminal event (`blocked`,
/// `budget_exceeded`, `timeout`, or `executed`), with `needs_approval`
/// possibly in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A tool call was attempted; `input` has already been redacted.
    Attempted {
        /// Request the call belongs to.
        request_id: String,
        /// Epoch milliseconds.
        timestamp: i64,
        /// Name of the invoked tool.
        tool_name: String,
        /// Redacted tool input.
        input: serde_json::Value,
    },
    /// The call was blocked by a policy decision (or a policy failure).
    Blocked {
        /// Request the call belongs to.
        request_id: String,
        /// Epoch milliseconds.
        timestamp: i64,
        /// Name of the invoked tool.
        tool_name: String,
        /// Why the call was blocked.
        reason: String,
    },
    /// The call requires human approval; execution continues, pausing is
    /// owned by the host.
    NeedsApproval {
        /// Request the call belongs to.
        request_id: String,
        /// Epoch milliseconds.
        timestamp: i64,
        /// Name of the invoked tool.
        tool_name: String,
        /// Why approval is required.
        reason: String,
    },
    /// The underlying tool completed successfully.
    Executed {
        /// Request the call belongs to.
        request_id: String,
        /// Epoch milliseconds.
        timestamp: i64,
        /// Name of the invoked tool.
        tool_name: String,
        /// Execution wall-clock duration.
        duration_ms: u64,
    },
    /// The per-call timer elapsed before the tool completed.
    Timeout {
        /// Request the call belongs to.
        request_id: String,
        /// Epoch milliseconds.
        timestamp: i64,
        /// Name of the invoked tool.
        tool_name: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },
    /// A call-count or duration budget ceiling was breached.
    BudgetExceeded {
        /// Request the call belongs to.
        request_id: String,
        /// Epoch milliseconds.
        timestamp: i64,
        /// Name of the invoked tool.
        tool_name: String,
        /// Which ceiling was breached.
        reason: String,
    },
}

impl AuditEvent {
    /// Build an `attempted` event. `input` must already be redacted.
    pub fn attempted(request_id: &str, tool_name: &str, input: serde_json::Value) -> Self {
        Self::Attempted {
            request_id: request_id.to_owned(),
            timestamp: now_millis(),
            tool_name: tool_name.to_owned(),
            input,
        }
    }

    /// Build a `blocked` event.
    pub fn blocked(request_id: &str, tool_name: &str, reason: impl Into<String>) -> Self {
        Self::Blocked {
            request_id: request_id.to_owned(),
            timestamp: now_millis(),
            tool_name: tool_name.to_owned(),
            reason: reason.into(),
        }
    }

    /// Build a `needs_approval` event.
    pub fn needs_approval(request_id: &str, tool_name: &str, reason: impl Into<String>) -> Self {
        Self::NeedsApproval {
            request_id: request_id.to_owned(),
            timestamp: now_millis(),
            tool_name: tool_name.to_owned(),
            reason: reason.into(),
        }
    }

    /// Build an `executed` event from the measured execution duration.
    pub fn executed(request_id: &str, tool_name: &str, duration: Duration) -> Self {
        Self::Executed {
            request_id: request_id.to_owned(),
            timestamp: now_millis(),
            tool_name: tool_name.to_owned(),
            duration_ms: clamp_millis(duration),
        }
    }

    /// Build a `timeout` event from the elapsed per-call timeout.
    pub fn timeout(request_id: &str, tool_name: &str, timeout: Duration) -> Self {
        Self::Timeout {
            request_id: request_id.to_owned(),
            timestamp: now_millis(),
            tool_name: tool_name.to_owned(),
            timeout_ms: clamp_millis(timeout),
        }
    }

    /// Build a `budget_exceeded` event.
    pub fn budget_exceeded(request_id: &str, tool_name: &str, reason: impl Into<String>) -> Self {
        Self::BudgetExceeded {
            request_id: request_id.to_owned(),
            timestamp: now_millis(),
            tool_name: tool_name.to_owned(),
            reason: reason.into(),
        }
    }

    /// The request this event belongs to.
    pub fn request_id(&self) -> &str {
        match self {
            Self::Attempted { request_id, .. }
            | Self::Blocked { request_id, .. }
            | Self::NeedsApproval { request_id, .. }
            | Self::Executed { request_id, .. }
            | Self::Timeout { request_id, .. }
            | Self::BudgetExceeded { request_id, .. } => request_id,
        }
    }

    /// The tool this event concerns.
    pub fn tool_name(&self) -> &str {
        match self {
            Self::Attempted { tool_name, .. }
            | Self::Blocked { tool_name, .. }
            | Self::NeedsApproval { tool_name, .. }
            | Self::Executed { tool_name, .. }
            | Self::Timeout { tool_name, .. }
            | Self::BudgetExceeded { tool_name, .. } => tool_name,
        }
    }

    /// The wire-format type tag for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Attempted { .. } => "attempted",
            Self::Blocked { .. } => "blocked",
            Self::NeedsApproval { .. } => "needs_approval",
            Self::Executed { .. } => "executed",
            Self::Timeout { .. } => "timeout",
            Self::BudgetExceeded { .. } => "budget_exceeded",
        }
    }
}

/// Current time as epoch milliseconds.
fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a duration to whole milliseconds, saturating on overflow.
fn clamp_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Sink trait
// ---------------------------------------------------------------------------

/// Errors from audit sinks.
///
/// These never propagate to the caller of a guarded tool; the pipeline logs
/// them and continues.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The underlying writer failed.
    #[error("audit sink I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The event could not be serialized.
    #[error("audit event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The sink was closed and can accept no further events.
    #[error("audit sink is closed")]
    Closed,

    /// The sink's internal lock was poisoned.
    #[error("audit sink lock poisoned")]
    Poisoned,
}

/// A consumer of audit events.
///
/// Sinks must see the full, correctly ordered event sequence for a given
/// request, but are otherwise free in how they persist it.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Consume one event.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the event cannot be recorded.
    async fn emit(&self, event: &AuditEvent) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Accumulates events in an ordered in-memory sequence.
///
/// Uses a sync [`Mutex`] since the critical section is brief (no awaits).
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    /// Create an empty in-memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, in emission order.
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(e) => {
                warn!(error = %e, "memory sink lock poisoned in events");
                Vec::new()
            }
        }
    }

    /// Events for a single request, in emission order.
    pub fn events_for_request(&self, request_id: &str) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events
                .iter()
                .filter(|event| event.request_id() == request_id)
                .cloned()
                .collect(),
            Err(e) => {
                warn!(error = %e, "memory sink lock poisoned in events_for_request");
                Vec::new()
            }
        }
    }

    /// Discard all recorded events.
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), SinkError> {
        let mut events = self.events.lock().map_err(|_| SinkError::Poisoned)?;
        events.push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Console / stream sink
// ---------------------------------------------------------------------------

/// Serializes each event to one JSON line on an arbitrary writer, immediately.
///
/// No buffering guarantees beyond the underlying stream.
pub struct ConsoleSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    /// Create a sink writing to stderr.
    pub fn stderr() -> Self {
        Self::from_writer(Box::new(std::io::stderr()))
    }

    /// Create a sink from an arbitrary writer (also used for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl std::fmt::Debug for ConsoleSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuditSink for ConsoleSink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), SinkError> {
        let line = serde_json::to_string(event)?;
        let mut writer = self.writer.lock().map_err(|_| SinkError::Poisoned)?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Append-only file sink
// ---------------------------------------------------------------------------

/// Appends one JSON line per event to a file, UTF-8, newline-terminated.
///
/// Writes are buffered until [`flush`](FileSink::flush) or
/// [`close`](FileSink::close); after close, further emits fail with
/// [`SinkError::Closed`].
pub struct FileSink {
    writer: Mutex<Option<BufWriter<std::fs::File>>>,
}

impl FileSink {
    /// Open (or create) the file at `path` in append mode.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// Flush buffered lines to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`] after close, or [`SinkError::Io`] on
    /// write failure.
    pub fn flush(&self) -> Result<(), SinkError> {
        let mut guard = self.writer.lock().map_err(|_| SinkError::Poisoned)?;
        let writer = guard.as_mut().ok_or(SinkError::Closed)?;
        writer.flush()?;
        Ok(())
    }

    /// Flush and close the sink for graceful shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the final flush fails. Closing an
    /// already-closed sink is a no-op.
    pub fn close(&self) -> Result<(), SinkError> {
        let mut guard = self.writer.lock().map_err(|_| SinkError::Poisoned)?;
        if let Some(mut writer) = guard.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuditSink for FileSink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), SinkError> {
        let line = serde_json::to_string(event)?;
        let mut guard = self.writer.lock().map_err(|_| SinkError::Poisoned)?;
        let writer = guard.as_mut().ok_or(SinkError::Closed)?;
        writeln!(writer, "{line}")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fan-out sink
// ---------------------------------------------------------------------------

/// Fans each event out to several sinks in turn.
///
/// A failing child is logged and skipped; the remaining sinks still see the
/// event, so each individual sink keeps its own complete ordered sequence.
#[derive(Clone)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl MultiSink {
    /// Compose the given sinks.
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl std::fmt::Debug for MultiSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl AuditSink for MultiSink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), SinkError> {
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event).await {
                warn!(error = %e, kind = event.kind(), "audit sink failed, continuing");
            }
        }
        Ok(())
    }
}

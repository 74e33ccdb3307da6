//! Toolguard — a guard pipeline for agent tool calls.
//!
//! Sits between an agent's decision to invoke a tool and the tool's actual
//! execution: decides allow/deny/needs-approval per call, enforces per-request
//! call-count and wall-clock budgets, bounds execution latency, and emits a
//! secret-scrubbed audit trail — without altering the tool's behaviour when
//! the call is permitted.
//!
//! See `DESIGN.md` for architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod audit;
pub mod policy;
pub mod redact;
pub mod tool;

pub mod guard;

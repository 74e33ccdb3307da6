//! Configuration loading and validation.
//!
//! A `toolguard.toml` file covers everything the pipeline consumes at
//! construction: budget limits, the simple policy's lists and approval
//! tiers, extra field-based redaction, and an optional audit file. Hosts
//! that build policies and sinks programmatically can skip this module
//! entirely.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::audit::{AuditSink, FileSink};
use crate::guard::context::{DEFAULT_MAX_CALLS, DEFAULT_MAX_DURATION_MS};
use crate::guard::pipeline::DEFAULT_TIMEOUT_MS;
use crate::guard::{GuardContext, GuardOptions};
use crate::policy::{RiskTier, SimplePolicy};
use crate::redact::{FieldRedactor, PatternRedactor, Redactor, RedactorChain};

/// Top-level guard configuration.
#[derive(Debug, Default, Deserialize)]
pub struct GuardConfig {
    /// Budget and timeout limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Simple policy rule sources.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Redaction settings applied on the audit path.
    #[serde(default)]
    pub redaction: RedactionConfig,

    /// Audit sink settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Budget and timeout limits.
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Maximum tool calls per request.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,

    /// Maximum request wall-clock duration in milliseconds; omit for none.
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: Option<u64>,

    /// Per-call execution timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
            max_duration_ms: default_max_duration_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Rule sources for the built-in [`SimplePolicy`].
#[derive(Debug, Deserialize)]
pub struct PolicyConfig {
    /// Tool names denied outright.
    #[serde(default)]
    pub denylist: Vec<String>,

    /// If present and non-empty, only these tool names are permitted.
    #[serde(default)]
    pub allowlist: Option<Vec<String>>,

    /// Risk tiers that require human approval.
    #[serde(default = "default_require_approval")]
    pub require_approval: Vec<RiskTier>,

    /// Tier assigned to names the heuristic cannot classify.
    #[serde(default)]
    pub fallback_tier: Option<RiskTier>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            denylist: Vec::new(),
            allowlist: None,
            require_approval: default_require_approval(),
            fallback_tier: None,
        }
    }
}

/// Redaction settings.
#[derive(Debug, Default, Deserialize)]
pub struct RedactionConfig {
    /// Field names masked regardless of value (case-insensitive), applied
    /// before the pattern pass.
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Audit sink settings.
#[derive(Debug, Default, Deserialize)]
pub struct AuditConfig {
    /// Append-only audit file path; omit to disable file auditing.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_max_tool_calls() -> u32 {
    DEFAULT_MAX_CALLS
}

fn default_max_duration_ms() -> Option<u64> {
    Some(DEFAULT_MAX_DURATION_MS)
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_require_approval() -> Vec<RiskTier> {
    vec![RiskTier::Write, RiskTier::Admin]
}

/// Load guard configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load_config(path: &Path) -> anyhow::Result<GuardConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: GuardConfig = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    config.validate()?;
    Ok(config)
}

impl GuardConfig {
    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns an error for zero limits or a zero duration ceiling.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.limits.max_tool_calls == 0 {
            anyhow::bail!("limits.max_tool_calls must be at least 1");
        }
        if self.limits.timeout_ms == 0 {
            anyhow::bail!("limits.timeout_ms must be at least 1");
        }
        if self.limits.max_duration_ms == Some(0) {
            anyhow::bail!("limits.max_duration_ms must be at least 1 when set");
        }
        Ok(())
    }

    /// Build the simple policy described by `[policy]`.
    pub fn build_policy(&self) -> SimplePolicy {
        let mut policy = SimplePolicy::new()
            .with_denylist(self.policy.denylist.clone())
            .with_approval_tiers(self.policy.require_approval.iter().copied());
        if let Some(allowlist) = &self.policy.allowlist {
            policy = policy.with_allowlist(allowlist.clone());
        }
        if let Some(tier) = self.policy.fallback_tier {
            policy = policy.with_fallback_tier(tier);
        }
        policy
    }

    /// Build the redactor described by `[redaction]`: field masking first
    /// (when any fields are configured), then the default pattern pass.
    pub fn build_redactor(&self) -> Arc<dyn Redactor> {
        let patterns: Arc<dyn Redactor> = Arc::new(PatternRedactor::default());
        if self.redaction.fields.is_empty() {
            return patterns;
        }
        Arc::new(RedactorChain::new(vec![
            Arc::new(FieldRedactor::new(self.redaction.fields.clone())),
            patterns,
        ]))
    }

    /// Build pipeline options: a fresh context from `[limits]`, the file
    /// sink from `[audit]` when configured, the redactor, and the timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit file cannot be opened.
    pub fn build_options(&self) -> anyhow::Result<GuardOptions> {
        let max_duration = self.limits.max_duration_ms.map(Duration::from_millis);
        let context = Arc::new(GuardContext::new(self.limits.max_tool_calls, max_duration));

        let sink: Option<Arc<dyn AuditSink>> = match &self.audit.file {
            Some(path) => Some(Arc::new(FileSink::open(path).map_err(|e| {
                anyhow::anyhow!("failed to open audit file {}: {e}", path.display())
            })?)),
            None => None,
        };

        Ok(GuardOptions {
            context: Some(context),
            sink,
            redactor: Some(self.build_redactor()),
            timeout: Some(Duration::from_millis(self.limits.timeout_ms)),
        })
    }
}

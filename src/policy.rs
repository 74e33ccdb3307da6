//! Policy engine: risk classification and allow/deny/approval decisions.
//!
//! A [`Policy`] assigns a coarse [`RiskTier`] to a tool call, then turns that
//! tier plus request state into a [`Decision`]. Policies may suspend (e.g. to
//! consult an external ruleset) but must not have side effects visible
//! outside the decision itself. [`SimplePolicy`] covers the common
//! denylist/allowlist/approval-tier case; [`PolicyBuilder`] composes ordered
//! classifier and rule stages for anything richer.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::guard::GuardContext;

// ---------------------------------------------------------------------------
// Tiers, classifications, decisions
// ---------------------------------------------------------------------------

/// Coarse classification of a tool's potential impact.
///
/// Meaning is caller-assigned; tiers carry no numeric ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Observes state without changing it.
    Read,
    /// Mutates state in a recoverable way.
    Write,
    /// Destructive or otherwise hard-to-reverse effect.
    Admin,
}

impl RiskTier {
    /// Wire-format label for this tier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A risk tier plus the optional reason it was assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The assigned tier.
    pub tier: RiskTier,
    /// Why this tier was assigned, if the classifier can say.
    pub reason: Option<String>,
}

impl Classification {
    /// A classification with no stated reason.
    pub fn new(tier: RiskTier) -> Self {
        Self { tier, reason: None }
    }

    /// A classification carrying a reason.
    pub fn with_reason(tier: RiskTier, reason: impl Into<String>) -> Self {
        Self {
            tier,
            reason: Some(reason.into()),
        }
    }
}

/// The policy's verdict for one invocation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The call is permitted.
    Allow,
    /// The call is denied outright.
    Deny {
        /// Human-readable explanation, always non-empty.
        reason: String,
    },
    /// The call is permitted but requires human approval first.
    NeedsApproval {
        /// Why approval is required, always non-empty.
        reason: String,
    },
}

impl Decision {
    /// Whether this decision carries an approval requirement.
    pub fn needs_approval(&self) -> bool {
        matches!(self, Self::NeedsApproval { .. })
    }

    /// Whether this decision blocks the call.
    pub fn is_deny(&self) -> bool {
        matches!(self, Self::Deny { .. })
    }

    /// The reason attached to a deny or approval decision.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny { reason } | Self::NeedsApproval { reason } => Some(reason),
        }
    }
}

/// Errors raised by a policy while classifying or deciding.
///
/// The pipeline fails closed on these: the approval probe reports "approval
/// needed" and the execution path blocks the call.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The classifier failed.
    #[error("classification failed for tool {tool}: {detail}")]
    Classification {
        /// The tool being classified.
        tool: String,
        /// What went wrong.
        detail: String,
    },

    /// The decision stage failed.
    #[error("decision failed for tool {tool}: {detail}")]
    Decision {
        /// The tool being decided on.
        tool: String,
        /// What went wrong.
        detail: String,
    },
}

/// Classifies tool calls and decides whether they may proceed.
///
/// Implementations are expected to be stateless or immutable and safely
/// shared read-only across concurrent calls and requests.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Assign a risk tier to a pending call.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Classification`] if the tier cannot be
    /// determined; the pipeline treats this as a hard block.
    async fn classify(&self, name: &str, input: &Value) -> Result<Classification, PolicyError>;

    /// Turn a classification plus request state into a decision.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Decision`] if no decision can be produced; the
    /// pipeline treats this as a hard block.
    async fn decide(
        &self,
        name: &str,
        input: &Value,
        ctx: &GuardContext,
        classification: &Classification,
    ) -> Result<Decision, PolicyError>;
}

// ---------------------------------------------------------------------------
// Name-based classification heuristic
// ---------------------------------------------------------------------------

/// Name tokens implying destructive or irreversible effect.
const ADMIN_TOKENS: &[&str] = &["delete", "remove", "destroy", "drop", "purge", "wipe"];

/// Name tokens implying mutation.
const WRITE_TOKENS: &[&str] = &[
    "create", "write", "update", "modify", "insert", "send", "post", "upload",
];

/// Best-effort tier classification from the tool name alone.
///
/// Case-insensitive substring match: admin tokens win over write tokens;
/// names matching neither get `fallback`. A name like `archive_invoice`
/// matches no token, so callers with better metadata should supply their own
/// classifier instead of relying on this.
pub fn classify_by_name(name: &str, fallback: RiskTier) -> Classification {
    let lowered = name.to_lowercase();
    for token in ADMIN_TOKENS {
        if lowered.contains(token) {
            return Classification::with_reason(
                RiskTier::Admin,
                format!("name contains {token:?}"),
            );
        }
    }
    for token in WRITE_TOKENS {
        if lowered.contains(token) {
            return Classification::with_reason(
                RiskTier::Write,
                format!("name contains {token:?}"),
            );
        }
    }
    Classification::new(fallback)
}

// ---------------------------------------------------------------------------
// Simple policy
// ---------------------------------------------------------------------------

/// Denylist / allowlist / approval-tier policy with fixed precedence.
///
/// Evaluation order: denylist always wins; then a configured non-empty
/// allowlist denies anything absent from it; then the approval tier set
/// (default `{write, admin}`) escalates to approval; otherwise allow.
/// Classification uses an explicit tier table when one is supplied, falling
/// back to [`classify_by_name`].
#[derive(Debug, Clone)]
pub struct SimplePolicy {
    denylist: Vec<String>,
    allowlist: Option<Vec<String>>,
    approve_tiers: HashSet<RiskTier>,
    tier_table: HashMap<String, RiskTier>,
    fallback_tier: RiskTier,
}

impl SimplePolicy {
    /// A policy with no lists, default approval tiers, and `read` fallback.
    pub fn new() -> Self {
        Self {
            denylist: Vec::new(),
            allowlist: None,
            approve_tiers: HashSet::from([RiskTier::Write, RiskTier::Admin]),
            tier_table: HashMap::new(),
            fallback_tier: RiskTier::Read,
        }
    }

    /// Deny these tool names outright, regardless of tier or allowlist.
    #[must_use]
    pub fn with_denylist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denylist = names.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict calls to these tool names. A non-empty allowlist denies
    /// everything absent from it; an empty one restricts nothing.
    #[must_use]
    pub fn with_allowlist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowlist = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the set of tiers that require approval.
    #[must_use]
    pub fn with_approval_tiers<I>(mut self, tiers: I) -> Self
    where
        I: IntoIterator<Item = RiskTier>,
    {
        self.approve_tiers = tiers.into_iter().collect();
        self
    }

    /// Pin explicit tiers for specific tool names, bypassing the name
    /// heuristic for those tools.
    #[must_use]
    pub fn with_tier_table<I, S>(mut self, table: I) -> Self
    where
        I: IntoIterator<Item = (S, RiskTier)>,
        S: Into<String>,
    {
        self.tier_table = table
            .into_iter()
            .map(|(name, tier)| (name.into(), tier))
            .collect();
        self
    }

    /// Tier assigned to names the heuristic cannot classify (default `read`).
    #[must_use]
    pub fn with_fallback_tier(mut self, tier: RiskTier) -> Self {
        self.fallback_tier = tier;
        self
    }
}

impl Default for SimplePolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Policy for SimplePolicy {
    async fn classify(&self, name: &str, _input: &Value) -> Result<Classification, PolicyError> {
        if let Some(tier) = self.tier_table.get(name) {
            return Ok(Classification::with_reason(*tier, "explicit tier table"));
        }
        Ok(classify_by_name(name, self.fallback_tier))
    }

    async fn decide(
        &self,
        name: &str,
        _input: &Value,
        _ctx: &GuardContext,
        classification: &Classification,
    ) -> Result<Decision, PolicyError> {
        if self.denylist.iter().any(|denied| denied == name) {
            return Ok(Decision::Deny {
                reason: format!("tool {name:?} is denylisted"),
            });
        }

        if let Some(allowlist) = &self.allowlist {
            if !allowlist.is_empty() && !allowlist.iter().any(|allowed| allowed == name) {
                return Ok(Decision::Deny {
                    reason: format!("tool {name:?} is not on the allowlist"),
                });
            }
        }

        if self.approve_tiers.contains(&classification.tier) {
            let reason = match &classification.reason {
                Some(why) => format!(
                    "{} tier requires approval ({why})",
                    classification.tier
                ),
                None => format!("{} tier requires approval", classification.tier),
            };
            return Ok(Decision::NeedsApproval { reason });
        }

        Ok(Decision::Allow)
    }
}

// ---------------------------------------------------------------------------
// Composable policy builder
// ---------------------------------------------------------------------------

/// A classifier stage: returns `Some` to answer, `None` to pass to the next.
type BoxedClassifier = Box<dyn Fn(&str, &Value) -> Option<Classification> + Send + Sync>;

/// A rule stage: returns `Some` to answer, `None` to pass to the next.
type BoxedRule =
    Box<dyn Fn(&str, &Value, &GuardContext, &Classification) -> Option<Decision> + Send + Sync>;

/// Builds a [`CompositePolicy`] from ordered classifier and rule stages.
///
/// This is the extension point for out-of-band classification sources (e.g.
/// a registry's declared risk tag) without touching precedence logic: each
/// stage either answers or passes, and the first definitive answer wins.
pub struct PolicyBuilder {
    classifiers: Vec<BoxedClassifier>,
    rules: Vec<BoxedRule>,
    fallback_tier: RiskTier,
}

impl Default for PolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyBuilder {
    /// Start an empty builder (no stages, `read`/allow defaults).
    pub fn new() -> Self {
        Self {
            classifiers: Vec::new(),
            rules: Vec::new(),
            fallback_tier: RiskTier::Read,
        }
    }

    /// Append a classifier stage.
    #[must_use]
    pub fn classifier(
        mut self,
        stage: impl Fn(&str, &Value) -> Option<Classification> + Send + Sync + 'static,
    ) -> Self {
        self.classifiers.push(Box::new(stage));
        self
    }

    /// Append a rule stage.
    #[must_use]
    pub fn rule(
        mut self,
        stage: impl Fn(&str, &Value, &GuardContext, &Classification) -> Option<Decision>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.rules.push(Box::new(stage));
        self
    }

    /// Tier used when no classifier stage answers (default `read`).
    #[must_use]
    pub fn fallback_tier(mut self, tier: RiskTier) -> Self {
        self.fallback_tier = tier;
        self
    }

    /// Finish the builder.
    pub fn build(self) -> CompositePolicy {
        CompositePolicy {
            classifiers: self.classifiers,
            rules: self.rules,
            fallback_tier: self.fallback_tier,
        }
    }
}

impl std::fmt::Debug for PolicyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyBuilder")
            .field("classifiers", &self.classifiers.len())
            .field("rules", &self.rules.len())
            .field("fallback_tier", &self.fallback_tier)
            .finish()
    }
}

/// Ordered-stage policy produced by [`PolicyBuilder`].
///
/// Classification: first classifier stage returning `Some` wins; if none
/// answer, the fallback tier applies. Decision: first rule stage returning
/// `Some` wins; if none answer, the call is allowed.
pub struct CompositePolicy {
    classifiers: Vec<BoxedClassifier>,
    rules: Vec<BoxedRule>,
    fallback_tier: RiskTier,
}

impl std::fmt::Debug for CompositePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositePolicy")
            .field("classifiers", &self.classifiers.len())
            .field("rules", &self.rules.len())
            .field("fallback_tier", &self.fallback_tier)
            .finish()
    }
}

#[async_trait]
impl Policy for CompositePolicy {
    async fn classify(&self, name: &str, input: &Value) -> Result<Classification, PolicyError> {
        for stage in &self.classifiers {
            if let Some(classification) = stage(name, input) {
                return Ok(classification);
            }
        }
        Ok(Classification::new(self.fallback_tier))
    }

    async fn decide(
        &self,
        name: &str,
        input: &Value,
        ctx: &GuardContext,
        classification: &Classification,
    ) -> Result<Decision, PolicyError> {
        for stage in &self.rules {
            if let Some(decision) = stage(name, input, ctx, classification) {
                return Ok(decision);
            }
        }
        Ok(Decision::Allow)
    }
}

//! Retry/backoff policy engine
//!
//! When a node fails, the engine asks a [`RecoveryPolicy`] two questions: what kind of
//! failure is this ([`RecoveryPolicy::classify`]) and what should happen next
//! ([`RecoveryPolicy::decide`]). The default [`RetryPolicyEngine`] answers with a
//! per-class strategy:
//!
//! ```text
//! class        wait before re-entry                     gives up when
//! ──────────── ──────────────────────────────────────── ───────────────────────────
//! rate_limit   min(base · 2^retry · jitter, cap)        retry_count > max_retries
//! database     min(base · (retry + 1), cap)             retry_count > max_retries
//! network      min(base · (retry + 1), cap)             retry_count > max_retries
//! api          none; fallback endpoint after 2 retries  retry_count > max_retries
//! timeout      none; operation timeout grows ×1.5       retry_count > max_retries
//! unknown      min(base · 2^retry, conservative cap)    retry_count > max_retries
//! validation   never retried                            immediately
//! ```
//!
//! Jitter is a factor in `[1.0, 1.5)`, so waits for a class never shrink as
//! `retry_count` grows.
//!
//! `decide` is pure: it returns a [`StateUpdate`] for the engine to merge and never
//! touches `retry_count`. The engine increments the counter when it re-enters the
//! failed node, and resets it once that node succeeds.

use crate::error::NodeError;
use crate::state::{ComplianceState, FailureReason, StateUpdate, WorkflowStatus};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimit,
    Database,
    Api,
    Validation,
    Timeout,
    Network,
    Unknown,
}

const DB_VENDORS: &[&str] = &[
    "postgres", "mysql", "sqlite", "redis", "mongo", "supabase", "database", "sqlx",
];

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Database => "database",
            ErrorClass::Api => "api",
            ErrorClass::Validation => "validation",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Network => "network",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Parse an explicit `error_type` tag
    pub fn from_type(error_type: &str) -> Option<Self> {
        match error_type.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "rate_limit" | "ratelimit" => Some(ErrorClass::RateLimit),
            "database" | "db" => Some(ErrorClass::Database),
            "api" => Some(ErrorClass::Api),
            "validation" => Some(ErrorClass::Validation),
            "timeout" => Some(ErrorClass::Timeout),
            "network" => Some(ErrorClass::Network),
            "unknown" => Some(ErrorClass::Unknown),
            _ => None,
        }
    }

    /// Classify a free-form error message by keyword
    ///
    /// More specific cues are checked first: "network timeout" is network, not
    /// timeout, and "postgres connection timeout" is database.
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_lowercase();
        let has = |cue: &str| msg.contains(cue);

        if has("rate limit") || has("429") || has("too many requests") {
            return ErrorClass::RateLimit;
        }

        if has("validation") || has("schema") || has("type error") || has("invalid parameter") {
            return ErrorClass::Validation;
        }

        if has("connection refused") || has("dns") || has("network timeout") {
            return ErrorClass::Network;
        }

        if has("pool exhausted")
            || ((has("connection") || has("timeout")) && DB_VENDORS.iter().any(|v| has(v)))
        {
            return ErrorClass::Database;
        }

        if has("404") || has("500") || has("external api") {
            return ErrorClass::Api;
        }

        if has("timeout") || has("timed out") || has("deadline exceeded") {
            return ErrorClass::Timeout;
        }

        ErrorClass::Unknown
    }

    /// Classify with an optional explicit tag taking priority
    pub fn classify(error_type: Option<&str>, message: &str) -> Self {
        error_type
            .and_then(Self::from_type)
            .unwrap_or_else(|| Self::from_message(message))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Validation)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&NodeError> for ErrorClass {
    fn from(err: &NodeError) -> Self {
        ErrorClass::classify(err.error_type.as_deref(), &err.message)
    }
}

/// Bases and caps for every backoff strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub rate_limit_base_ms: u64,
    pub rate_limit_cap_ms: u64,
    /// Base for the linear strategy used by database and network errors
    pub linear_base_ms: u64,
    pub linear_cap_ms: u64,
    pub unknown_base_ms: u64,
    pub unknown_cap_ms: u64,
    pub timeout_growth: f64,
    pub timeout_cap_ms: u64,
    /// Starting point when the state carries no operation timeout
    pub default_operation_timeout_ms: u64,
    /// Prior retries after which api errors switch to the fallback endpoint
    pub api_fallback_after: u32,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rate_limit_base_ms: 1_000,
            rate_limit_cap_ms: 60_000,
            linear_base_ms: 2_000,
            linear_cap_ms: 30_000,
            unknown_base_ms: 1_000,
            unknown_cap_ms: 10_000,
            timeout_growth: 1.5,
            timeout_cap_ms: 300_000,
            default_operation_timeout_ms: 30_000,
            api_fallback_after: 2,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Disable jitter (deterministic waits)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn exponential(&self, base_ms: u64, cap_ms: u64, retry_count: u32, jitter: bool) -> Duration {
        let factor = if jitter {
            rand::thread_rng().gen_range(1.0..1.5)
        } else {
            1.0
        };
        let exp = 2f64.powi(retry_count.min(62) as i32);
        let wait = (base_ms as f64 * exp * factor).min(cap_ms as f64);
        Duration::from_millis(wait as u64)
    }

    fn linear(&self, retry_count: u32) -> Duration {
        let wait = self
            .linear_base_ms
            .saturating_mul(u64::from(retry_count) + 1)
            .min(self.linear_cap_ms);
        Duration::from_millis(wait)
    }

    /// Wait before re-entry for a class, `None` when the class does not sleep
    pub fn wait_for(&self, class: ErrorClass, retry_count: u32) -> Option<Duration> {
        match class {
            ErrorClass::RateLimit => Some(self.exponential(
                self.rate_limit_base_ms,
                self.rate_limit_cap_ms,
                retry_count,
                self.jitter,
            )),
            ErrorClass::Database | ErrorClass::Network => Some(self.linear(retry_count)),
            ErrorClass::Unknown => Some(self.exponential(
                self.unknown_base_ms,
                self.unknown_cap_ms,
                retry_count,
                false,
            )),
            ErrorClass::Api | ErrorClass::Timeout | ErrorClass::Validation => None,
        }
    }

    /// Next operation timeout after a timeout-class failure
    pub fn grow_timeout(&self, current_ms: Option<u64>) -> u64 {
        let current = current_ms.unwrap_or(self.default_operation_timeout_ms) as f64;
        ((current * self.timeout_growth) as u64).min(self.timeout_cap_ms)
    }
}

/// What the engine should do with a failed node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    /// Retry against the alternate endpoint
    Fallback,
    Fail,
}

/// Outcome of [`RecoveryPolicy::decide`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub action: RecoveryAction,
    pub class: ErrorClass,
    /// Sleep before re-entry
    pub wait: Option<Duration>,
    /// Changes to merge into the state record
    pub patch: StateUpdate,
}

impl RetryDecision {
    pub fn wait_ms(&self) -> Option<u64> {
        self.wait.map(|w| w.as_millis() as u64)
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("no error recorded on the state")]
    NoErrorRecorded,

    #[error("policy failure: {0}")]
    Internal(String),
}

/// Classification and recovery decisions for failed nodes
pub trait RecoveryPolicy: Send + Sync {
    fn classify(&self, state: &ComplianceState) -> Result<ErrorClass, PolicyError>;

    fn decide(&self, state: &ComplianceState, class: ErrorClass) -> Result<RetryDecision, PolicyError>;
}

/// Default [`RecoveryPolicy`] implementing the per-class strategies
#[derive(Debug, Clone, Default)]
pub struct RetryPolicyEngine {
    config: BackoffConfig,
}

impl RetryPolicyEngine {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    fn fail(&self, class: ErrorClass, reason: FailureReason, message: String, state: &ComplianceState) -> RetryDecision {
        let patch = StateUpdate::new()
            .status(WorkflowStatus::Failed)
            .human_review()
            .stop(message)
            .metadata_entry("failure_reason", json!(reason.as_str()))
            .metadata_entry("error_class", json!(class.as_str()))
            .metadata_entry("retry_count", json!(state.retry_count));
        RetryDecision {
            action: RecoveryAction::Fail,
            class,
            wait: None,
            patch,
        }
    }

    fn retry(&self, class: ErrorClass, action: RecoveryAction, wait: Option<Duration>) -> RetryDecision {
        let mut patch = StateUpdate::new()
            .status(WorkflowStatus::Retrying)
            .metadata_entry("last_error_class", json!(class.as_str()));
        if let Some(wait) = wait {
            patch = patch.metadata_entry("retry_wait_ms", json!(wait.as_millis() as u64));
        }
        RetryDecision {
            action,
            class,
            wait,
            patch,
        }
    }
}

impl RecoveryPolicy for RetryPolicyEngine {
    fn classify(&self, state: &ComplianceState) -> Result<ErrorClass, PolicyError> {
        let error = state.last_error().ok_or(PolicyError::NoErrorRecorded)?;
        Ok(ErrorClass::classify(error.error_type.as_deref(), &error.message))
    }

    fn decide(&self, state: &ComplianceState, class: ErrorClass) -> Result<RetryDecision, PolicyError> {
        if state.retry_count > state.max_retries {
            return Ok(self.fail(
                class,
                FailureReason::MaxRetriesExceeded,
                format!(
                    "max retries exceeded ({}/{}) on {} error",
                    state.retry_count, state.max_retries, class
                ),
                state,
            ));
        }

        let decision = match class {
            ErrorClass::Validation => self.fail(
                class,
                FailureReason::NonRetryableError,
                "non-retryable validation error".to_string(),
                state,
            ),
            ErrorClass::Api if state.retry_count >= self.config.api_fallback_after => {
                let mut decision = self.retry(class, RecoveryAction::Fallback, None);
                decision.patch = decision
                    .patch
                    .metadata_entry("use_fallback_endpoint", json!(true));
                decision
            }
            ErrorClass::Timeout => {
                let mut decision = self.retry(class, RecoveryAction::Retry, None);
                decision.patch = decision
                    .patch
                    .operation_timeout(self.config.grow_timeout(state.operation_timeout_ms));
                decision
            }
            _ => self.retry(
                class,
                RecoveryAction::Retry,
                self.config.wait_for(class, state.retry_count),
            ),
        };

        Ok(decision)
    }
}

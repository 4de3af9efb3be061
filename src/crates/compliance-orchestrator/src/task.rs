//! Scheduled task descriptors
//!
//! A [`ScheduledTask`] is owned by the [`TaskScheduler`](crate::scheduler::TaskScheduler)
//! and mutated on every tick. Tasks enter the scheduler either from the `[[tasks]]`
//! configuration section or through
//! [`ComplianceOrchestrator::schedule_task`](crate::service::ComplianceOrchestrator::schedule_task),
//! both of which go through [`TaskDescriptor`].

use crate::scheduler::SchedulerConfig;
use crate::{OrchestratorError, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
/// Longest interval whose next run stays representable as a timestamp
const MAX_INTERVAL: u64 = 36_500 * DAY;

/// Five urgency levels, lower value runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum TaskPriority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl TaskPriority {
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
            TaskPriority::Background => "background",
        }
    }
}

impl TryFrom<u8> for TaskPriority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(TaskPriority::Critical),
            2 => Ok(TaskPriority::High),
            3 => Ok(TaskPriority::Normal),
            4 => Ok(TaskPriority::Low),
            5 => Ok(TaskPriority::Background),
            other => Err(format!("priority must be between 1 and 5, got {other}")),
        }
    }
}

impl From<TaskPriority> for u8 {
    fn from(priority: TaskPriority) -> Self {
        priority.value()
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    /// Excluded from selection until resumed
    Failed,
    /// Waiting out a backoff before the next attempt
    Retrying,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Retrying => "RETRYING",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    /// Eligible for selection once due
    pub fn is_ready(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a task runs
///
/// Accepted forms:
///
/// | Expression | Meaning |
/// |---|---|
/// | `every 30s`, `every 5m`, `every 2h`, `every 1d` | fixed interval |
/// | `hourly`, `daily`, `weekly` | fixed interval |
/// | `daily@02:30` | every day at 02:30 UTC |
/// | `cron:0 0 6 * * Mon-Fri *` | cron expression (seconds field first) |
/// | `once` | a single run |
#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(Duration),
    DailyAt(NaiveTime),
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
    Once,
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Schedule::Interval(interval)
    }

    pub fn is_periodic(&self) -> bool {
        !matches!(self, Schedule::Once)
    }

    /// First due time for a task registered at `now`
    ///
    /// Intervals and one-shot tasks are due immediately, clock-based schedules wait for
    /// their next fire time.
    pub fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(_) | Schedule::Once => Some(now),
            Schedule::DailyAt(_) | Schedule::Cron { .. } => self.next_after(now),
        }
    }

    /// Next due time after a run started at `now`; `None` for one-shot tasks
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(interval) => {
                let step = ChronoDuration::from_std(*interval).ok()?;
                now.checked_add_signed(step)
            }
            Schedule::DailyAt(time) => {
                let today = now.date_naive().and_time(*time).and_utc();
                if today > now {
                    Some(today)
                } else {
                    today.checked_add_signed(ChronoDuration::days(1))
                }
            }
            Schedule::Cron { schedule, .. } => schedule.after(&now).next(),
            Schedule::Once => None,
        }
    }
}

impl FromStr for Schedule {
    type Err = OrchestratorError;

    fn from_str(expression: &str) -> Result<Self> {
        let invalid = |reason: &str| OrchestratorError::InvalidSchedule {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = expression.trim();
        if let Some(cron_expr) = trimmed.strip_prefix("cron:") {
            let cron_expr = cron_expr.trim();
            let schedule = cron::Schedule::from_str(cron_expr).map_err(|e| invalid(&e.to_string()))?;
            return Ok(Schedule::Cron {
                expression: cron_expr.to_string(),
                schedule: Box::new(schedule),
            });
        }

        let lowered = trimmed.to_ascii_lowercase();
        match lowered.as_str() {
            "once" => return Ok(Schedule::Once),
            "hourly" => return Ok(Schedule::every(Duration::from_secs(HOUR))),
            "daily" => return Ok(Schedule::every(Duration::from_secs(DAY))),
            "weekly" => return Ok(Schedule::every(Duration::from_secs(WEEK))),
            _ => {}
        }

        if let Some(time) = lowered.strip_prefix("daily@") {
            let time = NaiveTime::parse_from_str(time.trim(), "%H:%M")
                .map_err(|_| invalid("expected daily@HH:MM"))?;
            return Ok(Schedule::DailyAt(time));
        }

        if let Some(spec) = lowered.strip_prefix("every") {
            let spec = spec.trim().replace(' ', "");
            if spec.len() < 2 {
                return Err(invalid("expected every <N><s|m|h|d>"));
            }
            let (amount, unit) = spec.split_at(spec.len() - 1);
            let amount: u64 = amount
                .parse()
                .map_err(|_| invalid("interval amount must be a positive integer"))?;
            if amount == 0 {
                return Err(invalid("interval must be greater than zero"));
            }
            let unit_secs = match unit {
                "s" => 1,
                "m" => MINUTE,
                "h" => HOUR,
                "d" => DAY,
                _ => return Err(invalid("interval unit must be one of s, m, h, d")),
            };
            let secs = amount
                .checked_mul(unit_secs)
                .filter(|secs| *secs <= MAX_INTERVAL)
                .ok_or_else(|| invalid("interval must not exceed 36500 days"))?;
            return Ok(Schedule::every(Duration::from_secs(secs)));
        }

        Err(invalid("unrecognised schedule"))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval(interval) => {
                let secs = interval.as_secs();
                if secs > 0 && secs % DAY == 0 {
                    write!(f, "every {}d", secs / DAY)
                } else if secs > 0 && secs % HOUR == 0 {
                    write!(f, "every {}h", secs / HOUR)
                } else if secs > 0 && secs % MINUTE == 0 {
                    write!(f, "every {}m", secs / MINUTE)
                } else {
                    write!(f, "every {secs}s")
                }
            }
            Schedule::DailyAt(time) => write!(f, "daily@{}", time.format("%H:%M")),
            Schedule::Cron { expression, .. } => write!(f, "cron:{expression}"),
            Schedule::Once => f.write_str("once"),
        }
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Schedule::Interval(a), Schedule::Interval(b)) => a == b,
            (Schedule::DailyAt(a), Schedule::DailyAt(b)) => a == b,
            (Schedule::Cron { expression: a, .. }, Schedule::Cron { expression: b, .. }) => a == b,
            (Schedule::Once, Schedule::Once) => true,
            _ => false,
        }
    }
}

impl Serialize for Schedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Schedule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let expression = String::deserialize(deserializer)?;
        expression.parse().map_err(serde::de::Error::custom)
    }
}

/// A unit of work owned by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    /// Router key, e.g. `update_compliance_scores`
    pub task_type: String,
    pub schedule: Schedule,
    pub priority: TaskPriority,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub status: TaskStatus,
    /// Scheduler-level attempts, independent of the workflow's own retry counter
    pub retry_count: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub paused: bool,
    pub params: Value,
    pub last_error: Option<String>,
    pub last_result: Option<Value>,
    pub run_count: u64,
}

impl ScheduledTask {
    pub fn new(task_type: impl Into<String>, schedule: Schedule) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            schedule,
            priority: TaskPriority::default(),
            max_retries: defaults.default_max_retries,
            timeout_secs: defaults.default_timeout_secs,
            status: TaskStatus::Pending,
            retry_count: 0,
            last_run: None,
            next_run: None,
            paused: false,
            params: Value::Null,
            last_error: None,
            last_result: None,
            run_count: 0,
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Override the first due time
    pub fn with_next_run(mut self, next_run: DateTime<Utc>) -> Self {
        self.next_run = Some(next_run);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Ready, not paused, and due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_ready() && !self.paused && self.next_run.is_some_and(|at| at <= now)
    }
}

/// Serialized form used by configuration and the service API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(default)]
    pub task_id: Option<String>,
    pub task_type: String,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub params: Value,
}

fn default_schedule() -> String {
    "once".to_string()
}

impl TaskDescriptor {
    pub fn new(task_type: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            task_id: None,
            task_type: task_type.into(),
            schedule: schedule.into(),
            priority: TaskPriority::default(),
            max_retries: None,
            timeout_secs: None,
            params: Value::Null,
        }
    }

    /// Build a task, filling unset limits from the scheduler defaults
    pub fn into_task(self, defaults: &SchedulerConfig) -> Result<ScheduledTask> {
        let schedule: Schedule = self.schedule.parse()?;
        let mut task = ScheduledTask::new(self.task_type, schedule)
            .with_priority(self.priority)
            .with_max_retries(self.max_retries.unwrap_or(defaults.default_max_retries))
            .with_timeout(Duration::from_secs(
                self.timeout_secs.unwrap_or(defaults.default_timeout_secs),
            ))
            .with_params(self.params);
        if let Some(task_id) = self.task_id {
            task = task.with_id(task_id);
        }
        Ok(task)
    }
}

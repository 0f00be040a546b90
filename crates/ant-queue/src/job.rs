//! Job definitions

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Backend-assigned job identifier.
///
/// Opaque to the engine: the in-memory and Redis backends both hand out
/// monotonically increasing counters, but nothing relies on that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Where a job currently sits in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be picked up
    Waiting,
    /// Scheduled for later (dispatch delay, retry backoff or repeat)
    Delayed,
    /// Claimed by a worker instance
    Active,
    /// Handler returned successfully
    Completed,
    /// Failed with no attempts left
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" | "wait" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Shape of the delay curve between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Retry backoff descriptor stored on each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    #[serde(rename = "delay_ms", with = "duration_ms")]
    pub delay: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
        }
    }
}

/// Recurring submission. Bookkeeping lives in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    #[serde(rename = "every_ms", with = "duration_ms")]
    pub every: Duration,
    /// Total number of occurrences, unbounded when `None`
    pub limit: Option<u32>,
}

impl RepeatOptions {
    pub fn every(every: Duration) -> Self {
        Self { every, limit: None }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether another occurrence follows the one numbered `count` (0-based).
    pub fn has_next(&self, count: u32) -> bool {
        self.limit.map_or(true, |limit| count + 1 < limit)
    }
}

/// Caller-supplied overrides, merged over the dispatcher defaults.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub remove_on_complete: Option<bool>,
    pub remove_on_fail: Option<bool>,
    pub delay: Option<Duration>,
    pub repeat: Option<RepeatOptions>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = Some(remove);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }
}

/// Resolved per-job settings, persisted alongside the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    pub attempts: u32,
    pub backoff: Option<Backoff>,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
    pub repeat: Option<RepeatOptions>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: None,
            remove_on_complete: false,
            remove_on_fail: false,
            repeat: None,
        }
    }
}

/// A job about to be pushed onto a queue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub payload: serde_json::Value,
    pub settings: JobSettings,
    pub delay: Option<Duration>,
    /// Occurrence number for repeatable jobs
    pub repeat_count: u32,
}

impl NewJob {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            settings: JobSettings::default(),
            delay: None,
            repeat_count: 0,
        }
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Next occurrence of a repeatable job, if its limit allows one.
    pub fn next_occurrence(job: &Job) -> Option<Self> {
        let repeat = job.settings.repeat?;
        if !repeat.has_next(job.repeat_count) {
            return None;
        }
        Some(Self {
            name: job.name.clone(),
            payload: job.payload.clone(),
            settings: job.settings.clone(),
            delay: Some(repeat.every),
            repeat_count: job.repeat_count + 1,
        })
    }
}

/// A persisted job entry, as read back from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub payload: serde_json::Value,
    pub settings: JobSettings,
    pub state: JobState,
    /// Failures so far; starts at 0
    pub attempts_made: u32,
    pub stalled_count: u32,
    pub repeat_count: u32,
    pub progress: Option<serde_json::Value>,
    pub return_value: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Builds the stored form of a freshly pushed job.
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        let delay = new.delay.filter(|d| !d.is_zero());
        let run_at = match delay {
            Some(d) => time_after(now, d),
            None => now,
        };
        Self {
            id,
            name: new.name,
            payload: new.payload,
            settings: new.settings,
            state: if delay.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            attempts_made: 0,
            stalled_count: 0,
            repeat_count: new.repeat_count,
            progress: None,
            return_value: None,
            failed_reason: None,
            created_at: now,
            run_at,
            processed_at: None,
            finished_at: None,
        }
    }

    /// A job the backend handed back without a name cannot be routed.
    pub fn is_malformed(&self) -> bool {
        self.name.trim().is_empty()
    }
}

fn time_delta(d: Duration) -> Option<TimeDelta> {
    i64::try_from(d.as_millis())
        .ok()
        .and_then(TimeDelta::try_milliseconds)
}

/// `at + d`, saturating at the latest representable instant.
pub fn time_after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    time_delta(d)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, saturating at the earliest representable instant.
pub fn time_before(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    time_delta(d)
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

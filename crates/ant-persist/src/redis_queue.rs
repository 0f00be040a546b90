//! Redis queue backend.
//!
//! # Key layout
//!
//! Every key of a queue lives under its namespaced key `{prefix}:{queue}`:
//!
//! - `{key}:id`: job id counter
//! - `{key}:job:{id}`: job hash (`name`, `data`, `opts`, `state`, counters,
//!   timestamps in epoch milliseconds)
//! - `{key}:wait`: waiting ids; pushed on the left, popped from the right
//! - `{key}:active`: claimed ids
//! - `{key}:delayed`: sorted set of ids scored by run time
//! - `{key}:completed`, `{key}:failed`: sorted sets scored by finish time
//! - `{key}:paused`: present while the queue is paused
//! - `{key}:lock:{id}`: lock of an active job, expires unless renewed
//!
//! State changes that touch more than one key run as Lua scripts so that two
//! consumers can never claim the same job.

use std::collections::HashMap;
use std::time::Duration;

use ant_queue::backend::{JobCounts, QueueBackend, QueueError, StalledReport, STALLED_LIMIT_REASON};
use ant_queue::config::ConnectionConfig;
use ant_queue::job::{Job, JobId, JobSettings, JobState, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use tracing::{debug, info, warn};

use crate::connection_url;

/// Shared by every script that moves a job out of `active`. Jobs that are no
/// longer active are left alone; ids whose hash vanished are unlinked.
const RELEASE_ACTIVE: &str = r#"
local base = KEYS[1]
local id = ARGV[1]
local jobKey = base .. ':job:' .. id
local state = redis.call('HGET', jobKey, 'state')
if state ~= 'active' then
  if not state then
    redis.call('LREM', base .. ':active', 0, id)
    redis.call('DEL', base .. ':lock:' .. id)
  end
  return 0
end
redis.call('LREM', base .. ':active', 0, id)
redis.call('DEL', base .. ':lock:' .. id)
"#;

const ADD_JOB: &str = r#"
local base = KEYS[1]
local id = tostring(redis.call('INCR', base .. ':id'))
local jobKey = base .. ':job:' .. id
local now = tonumber(ARGV[4])
local runAt = tonumber(ARGV[5])
redis.call('HSET', jobKey,
  'name', ARGV[1], 'data', ARGV[2], 'opts', ARGV[3],
  'attempts_made', 0, 'stalled_count', 0, 'repeat_count', ARGV[6],
  'created_at', now, 'run_at', runAt)
if runAt > now then
  redis.call('HSET', jobKey, 'state', 'delayed')
  redis.call('ZADD', base .. ':delayed', runAt, id)
else
  redis.call('HSET', jobKey, 'state', 'waiting')
  redis.call('LPUSH', base .. ':wait', id)
end
return id
"#;

const POP_JOB: &str = r#"
local base = KEYS[1]
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', base .. ':delayed', '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', base .. ':delayed', id)
  redis.call('HSET', base .. ':job:' .. id, 'state', 'waiting')
  redis.call('LPUSH', base .. ':wait', id)
end
if redis.call('EXISTS', base .. ':paused') == 1 then
  return false
end
local id = redis.call('RPOPLPUSH', base .. ':wait', base .. ':active')
if not id then
  return false
end
redis.call('SET', base .. ':lock:' .. id, now, 'PX', ARGV[2])
redis.call('HSET', base .. ':job:' .. id, 'state', 'active', 'processed_at', now)
return id
"#;

const COMPLETE_JOB: &str = r#"
if ARGV[3] == '1' then
  redis.call('DEL', jobKey)
else
  redis.call('HSET', jobKey, 'state', 'completed', 'return_value', ARGV[2], 'finished_at', ARGV[4])
  redis.call('ZADD', base .. ':completed', ARGV[4], id)
end
return 1
"#;

const RETRY_JOB: &str = r#"
local now = tonumber(ARGV[4])
local delay = tonumber(ARGV[3])
redis.call('HINCRBY', jobKey, 'attempts_made', 1)
redis.call('HSET', jobKey, 'failed_reason', ARGV[2])
if delay > 0 then
  redis.call('HSET', jobKey, 'state', 'delayed', 'run_at', now + delay)
  redis.call('ZADD', base .. ':delayed', now + delay, id)
else
  redis.call('HSET', jobKey, 'state', 'waiting', 'run_at', now)
  redis.call('LPUSH', base .. ':wait', id)
end
return 1
"#;

const FAIL_JOB: &str = r#"
if ARGV[3] == '1' then
  redis.call('DEL', jobKey)
else
  redis.call('HINCRBY', jobKey, 'attempts_made', 1)
  redis.call('HSET', jobKey, 'state', 'failed', 'failed_reason', ARGV[2], 'finished_at', ARGV[4])
  redis.call('ZADD', base .. ':failed', ARGV[4], id)
end
return 1
"#;

const UPDATE_PROGRESS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'progress', ARGV[1])
return 1
"#;

const CLEAN_JOBS: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[2] .. id)
  redis.call('ZREM', KEYS[1], id)
end
return #ids
"#;

const RECOVER_STALLED: &str = r#"
local base = KEYS[1]
local activeKey = base .. ':active'
local requeued, failed = {}, {}
for _, id in ipairs(redis.call('LRANGE', activeKey, 0, -1)) do
  if redis.call('EXISTS', base .. ':lock:' .. id) == 0 then
    redis.call('LREM', activeKey, 0, id)
    local jobKey = base .. ':job:' .. id
    if redis.call('EXISTS', jobKey) == 1 then
      local stalled = redis.call('HINCRBY', jobKey, 'stalled_count', 1)
      if stalled > tonumber(ARGV[1]) then
        redis.call('HINCRBY', jobKey, 'attempts_made', 1)
        redis.call('HSET', jobKey, 'state', 'failed', 'failed_reason', ARGV[3], 'finished_at', ARGV[2])
        redis.call('ZADD', base .. ':failed', ARGV[2], id)
        table.insert(failed, id)
      else
        redis.call('HSET', jobKey, 'state', 'waiting')
        redis.call('RPUSH', base .. ':wait', id)
        table.insert(requeued, id)
      end
    end
  end
end
return {requeued, failed}
"#;

struct Scripts {
    add: Script,
    pop: Script,
    complete: Script,
    retry: Script,
    fail: Script,
    progress: Script,
    clean: Script,
    recover: Script,
}

impl Scripts {
    fn load() -> Self {
        let release = |body: &str| Script::new(&format!("{RELEASE_ACTIVE}{body}"));
        Self {
            add: Script::new(ADD_JOB),
            pop: Script::new(POP_JOB),
            complete: release(COMPLETE_JOB),
            retry: release(RETRY_JOB),
            fail: release(FAIL_JOB),
            progress: Script::new(UPDATE_PROGRESS),
            clean: Script::new(CLEAN_JOBS),
            recover: Script::new(RECOVER_STALLED),
        }
    }
}

/// Key of one part of a queue's storage.
pub(crate) fn key(queue: &str, part: &str) -> String {
    format!("{queue}:{part}")
}

pub(crate) fn job_key(queue: &str, id: &JobId) -> String {
    format!("{queue}:job:{id}")
}

/// List or sorted set holding the ids of jobs in `state`.
pub(crate) fn state_key(queue: &str, state: JobState) -> String {
    let part = match state {
        JobState::Waiting => "wait",
        JobState::Delayed => "delayed",
        JobState::Active => "active",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
    };
    key(queue, part)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn redis_error(e: RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        QueueError::Connection(e.to_string())
    } else {
        QueueError::Backend(e.to_string())
    }
}

fn timestamp(fields: &HashMap<String, String>, field: &str) -> Option<DateTime<Utc>> {
    let ms = fields.get(field)?.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(ms).single()
}

fn counter(fields: &HashMap<String, String>, field: &str) -> u32 {
    fields
        .get(field)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn json_field(
    fields: &HashMap<String, String>,
    field: &str,
) -> Result<Option<serde_json::Value>, serde_json::Error> {
    fields
        .get(field)
        .map(|raw| serde_json::from_str(raw))
        .transpose()
}

/// Rebuild a job from its hash.
///
/// A hash without `data`, or whose `data` or `opts` is not valid JSON,
/// decodes to a job with an empty name. The runtime completes such jobs
/// without running them, so a claimed job never stays stuck in `active`.
pub(crate) fn decode_job(id: JobId, fields: &HashMap<String, String>) -> Job {
    let payload = json_field(fields, "data").unwrap_or_else(|e| {
        warn!(job_id = %id, error = %e, "Job data is not valid JSON");
        None
    });
    let settings = match fields.get("opts").map(|raw| serde_json::from_str::<JobSettings>(raw)) {
        Some(Ok(settings)) => Some(settings),
        Some(Err(e)) => {
            warn!(job_id = %id, error = %e, "Job options are not valid JSON");
            None
        }
        None => Some(JobSettings::default()),
    };

    let name = match (&payload, &settings) {
        (Some(_), Some(_)) => fields.get("name").cloned().unwrap_or_default(),
        _ => String::new(),
    };

    let state = fields
        .get("state")
        .and_then(|s| s.parse().ok())
        .unwrap_or(JobState::Waiting);

    let created_at = timestamp(fields, "created_at").unwrap_or_default();

    let progress = json_field(fields, "progress").ok().flatten();
    let return_value = json_field(fields, "return_value").ok().flatten();

    Job {
        id,
        name,
        payload: payload.unwrap_or(serde_json::Value::Null),
        settings: settings.unwrap_or_default(),
        state,
        attempts_made: counter(fields, "attempts_made"),
        stalled_count: counter(fields, "stalled_count"),
        repeat_count: counter(fields, "repeat_count"),
        progress,
        return_value,
        failed_reason: fields.get("failed_reason").cloned(),
        created_at,
        run_at: timestamp(fields, "run_at").unwrap_or(created_at),
        processed_at: timestamp(fields, "processed_at"),
        finished_at: timestamp(fields, "finished_at"),
    }
}

/// Queue backend on a Redis server, shared by any number of processes.
pub struct RedisBackend {
    conn: ConnectionManager,
    scripts: Scripts,
}

impl RedisBackend {
    /// Connects to Redis. The connection manager reconnects on its own
    /// afterwards; a failure here means the server is unreachable.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(connection_url(config).as_str())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        info!(address = %config.address(), "Connected to Redis");
        Ok(Self::from_connection(conn))
    }

    /// Backend on an existing connection, for sharing one connection with
    /// other components.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scripts: Scripts::load(),
        }
    }

    async fn fetch(&self, queue: &str, id: JobId) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(job_key(queue, &id))
            .await
            .map_err(redis_error)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_job(id, &fields)))
    }

    fn log_ignored(id: &JobId, moved: i64, transition: &str) {
        if moved == 0 {
            debug!(job_id = %id, transition, "Ignoring transition on inactive job");
        }
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn open(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        debug!(queue, "Redis queue ready");
        Ok(())
    }

    async fn push(&self, queue: &str, job: NewJob) -> Result<JobId, QueueError> {
        let data = serde_json::to_string(&job.payload)?;
        let opts = serde_json::to_string(&job.settings)?;
        let now = now_ms();
        let run_at = now.saturating_add(job.delay.map_or(0, millis));

        let mut conn = self.conn.clone();
        let id: String = self
            .scripts
            .add
            .key(queue)
            .arg(&job.name)
            .arg(data)
            .arg(opts)
            .arg(now)
            .arg(run_at)
            .arg(job.repeat_count)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(JobId::new(id))
    }

    async fn pop(&self, queue: &str, lock: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = self
            .scripts
            .pop
            .key(queue)
            .arg(now_ms())
            .arg(millis(lock).max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        let Some(id) = claimed else {
            return Ok(None);
        };
        let id = JobId::new(id);

        // The hash can be gone when someone deleted it behind our back
        let job = match self.fetch(queue, id.clone()).await? {
            Some(job) => job,
            None => decode_job(id, &HashMap::new()),
        };

        if let Some(next) = NewJob::next_occurrence(&job) {
            let next_id = self.push(queue, next).await?;
            debug!(job_id = %job.id, next_id = %next_id, "Scheduled next repeat occurrence");
        }
        Ok(Some(job))
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: &JobId,
        lock: Duration,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let renewed: Option<String> = redis::cmd("SET")
            .arg(key(queue, &format!("lock:{id}")))
            .arg(now_ms())
            .arg("PX")
            .arg(millis(lock).max(1))
            .arg("XX")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(renewed.is_some())
    }

    async fn complete(
        &self,
        queue: &str,
        id: &JobId,
        return_value: serde_json::Value,
        remove: bool,
    ) -> Result<bool, QueueError> {
        let value = serde_json::to_string(&return_value)?;
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .complete
            .key(queue)
            .arg(id.as_str())
            .arg(value)
            .arg(flag(remove))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Self::log_ignored(id, moved, "complete");
        Ok(moved == 1)
    }

    async fn retry(
        &self,
        queue: &str,
        id: &JobId,
        reason: &str,
        delay: Duration,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .retry
            .key(queue)
            .arg(id.as_str())
            .arg(reason)
            .arg(millis(delay))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Self::log_ignored(id, moved, "retry");
        Ok(moved == 1)
    }

    async fn fail(
        &self,
        queue: &str,
        id: &JobId,
        reason: &str,
        remove: bool,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .fail
            .key(queue)
            .arg(id.as_str())
            .arg(reason)
            .arg(flag(remove))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Self::log_ignored(id, moved, "fail");
        Ok(moved == 1)
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        progress: serde_json::Value,
    ) -> Result<(), QueueError> {
        let value = serde_json::to_string(&progress)?;
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .scripts
            .progress
            .key(job_key(queue, id))
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        if updated == 0 {
            return Err(QueueError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key(queue, "paused"), 1)
            .await
            .map_err(redis_error)
    }

    async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key(queue, "paused"))
            .await
            .map_err(redis_error)
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        conn.exists(key(queue, "paused")).await.map_err(redis_error)
    }

    async fn count(&self, queue: &str, state: JobState) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let key = state_key(queue, state);
        match state {
            JobState::Waiting | JobState::Active => conn.llen(key).await,
            _ => conn.zcard(key).await,
        }
        .map_err(redis_error)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.fetch(queue, id.clone()).await
    }

    async fn jobs(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let key = state_key(queue, state);
        let last = isize::try_from(limit).unwrap_or(isize::MAX);

        let ids: Vec<String> = match state {
            // Lists are consumed from the right: next job first
            JobState::Waiting | JobState::Active => {
                let mut ids: Vec<String> = conn.lrange(&key, -last, -1).await.map_err(redis_error)?;
                ids.reverse();
                ids
            }
            _ => conn.zrange(&key, 0, last - 1).await.map_err(redis_error)?,
        };
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(format!("{queue}:job:{id}"));
        }
        let hashes: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(redis_error)?;

        Ok(ids
            .into_iter()
            .zip(hashes)
            .filter(|(_, fields)| !fields.is_empty())
            .map(|(id, fields)| decode_job(JobId::new(id), &fields))
            .collect())
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        state: JobState,
    ) -> Result<usize, QueueError> {
        if !state.is_finished() {
            return Err(QueueError::Backend(format!(
                "only finished jobs can be cleaned, got {state}"
            )));
        }
        let mut conn = self.conn.clone();
        let removed: usize = self
            .scripts
            .clean
            .key(state_key(queue, state))
            .arg(now_ms().saturating_sub(millis(grace)))
            .arg(key(queue, "job:"))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(removed)
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<StalledReport, QueueError> {
        let mut conn = self.conn.clone();
        let (requeued, failed): (Vec<String>, Vec<String>) = self
            .scripts
            .recover
            .key(queue)
            .arg(max_stalled_count)
            .arg(now_ms())
            .arg(STALLED_LIMIT_REASON)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        Ok(StalledReport {
            requeued: requeued.into_iter().map(JobId::new).collect(),
            failed: failed.into_iter().map(JobId::new).collect(),
        })
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed, paused): (
            usize,
            usize,
            usize,
            usize,
            usize,
            bool,
        ) = redis::pipe()
            .llen(state_key(queue, JobState::Waiting))
            .zcard(state_key(queue, JobState::Delayed))
            .llen(state_key(queue, JobState::Active))
            .zcard(state_key(queue, JobState::Completed))
            .zcard(state_key(queue, JobState::Failed))
            .exists(key(queue, "paused"))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
            paused,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_layout() {
        let q = "ant:mail";
        assert_eq!(job_key(q, &JobId::from(7)), "ant:mail:job:7");
        assert_eq!(state_key(q, JobState::Waiting), "ant:mail:wait");
        assert_eq!(state_key(q, JobState::Failed), "ant:mail:failed");
        assert_eq!(key(q, "paused"), "ant:mail:paused");
    }

    #[test]
    fn test_decode_job_hash() {
        let settings = serde_json::to_string(&JobSettings {
            attempts: 5,
            ..JobSettings::default()
        })
        .unwrap();
        let hash = fields(&[
            ("name", "send"),
            ("data", r#"{"to":"ant","tags":[]}"#),
            ("opts", &settings),
            ("state", "active"),
            ("attempts_made", "2"),
            ("progress", "40"),
            ("created_at", "1700000000000"),
            ("processed_at", "1700000001000"),
        ]);

        let job = decode_job(JobId::from(3), &hash);
        assert_eq!(job.name, "send");
        assert_eq!(job.payload, json!({"to": "ant", "tags": []}));
        assert_eq!(job.settings.attempts, 5);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.progress, Some(json!(40)));
        assert_eq!(job.created_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(job.run_at, job.created_at);
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn test_hash_without_data_is_malformed() {
        let job = decode_job(JobId::from(1), &fields(&[("name", "send"), ("state", "active")]));
        assert!(job.is_malformed());
        assert!(decode_job(JobId::from(2), &HashMap::new()).is_malformed());
    }

    #[test]
    fn test_corrupt_json_decodes_as_malformed() {
        let bad_data = decode_job(
            JobId::from(1),
            &fields(&[("name", "send"), ("data", "{not json"), ("state", "active")]),
        );
        assert!(bad_data.is_malformed());
        assert_eq!(bad_data.state, JobState::Active);

        let bad_opts = decode_job(
            JobId::from(2),
            &fields(&[("name", "send"), ("data", "{}"), ("opts", "[")]),
        );
        assert!(bad_opts.is_malformed());

        let bad_progress = decode_job(
            JobId::from(3),
            &fields(&[("name", "send"), ("data", "{}"), ("progress", "half")]),
        );
        assert!(!bad_progress.is_malformed());
        assert!(bad_progress.progress.is_none());
    }

    #[test]
    fn test_scripts_share_release_prelude() {
        let release = format!("{RELEASE_ACTIVE}{COMPLETE_JOB}");
        assert!(release.contains("state ~= 'active'"));
        assert!(release.trim_end().ends_with("return 1"));
    }
}

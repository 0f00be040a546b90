//! Built-in worker for smoke-testing a deployment end to end.
//!
//! Jobs it understands:
//! - `probe.echo`: returns its payload
//! - `probe.sleep`: sleeps `{"ms": n}` milliseconds, reporting progress
//! - `probe.fail`: fails with `{"reason": "..."}`

use std::time::Duration;

use ant_queue::{HandlerResult, Job, JobContext, Worker};
use async_trait::async_trait;
use serde_json::json;

const SLEEP_STEPS: u64 = 4;

#[derive(Debug, Default)]
pub struct ProbeWorker;

#[async_trait]
impl Worker for ProbeWorker {
    fn name(&self) -> &str {
        "ProbeWorker"
    }

    async fn handle(&self, job: &Job, ctx: &JobContext) -> HandlerResult {
        match job.name.as_str() {
            "probe.echo" => Ok(job.payload.clone()),
            "probe.sleep" => {
                let total = job.payload.get("ms").and_then(|v| v.as_u64()).unwrap_or(1000);
                for step in 1..=SLEEP_STEPS {
                    tokio::time::sleep(Duration::from_millis(total / SLEEP_STEPS)).await;
                    ctx.progress(json!(step * 100 / SLEEP_STEPS)).await?;
                }
                Ok(json!({ "slept_ms": total }))
            }
            "probe.fail" => {
                let reason = job
                    .payload
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("probe failure requested");
                Err(reason.into())
            }
            other => Err(format!("ProbeWorker cannot handle job {other:?}").into()),
        }
    }
}

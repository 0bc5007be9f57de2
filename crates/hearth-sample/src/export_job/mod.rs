//! # Export Job Actor
//!
//! A resumable, alarm-driven export pipeline. One instance per export job;
//! every transition persists progress before re-arming, so a crash or
//! hibernation at any point resumes from the last completed step rather
//! than restarting the job.
//!
//! ```text
//! Pending -> Querying -> Assembling -> Uploading -> [Notifying] -> Complete
//!                 \___________\____________\_____________\______> Failed
//! ```
//!
//! Assembling walks the item list in batches of 25 with a persisted cursor,
//! re-arming between batches so one slow job never monopolizes the
//! instance's mailbox.

use async_trait::async_trait;
use hearth::{Actor, ActorHost, HearthError, RequestContext, Response, Route};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const JOB_KEY: &str = "job";
const BATCH_SIZE: u64 = 25;
const STEP_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Querying,
    Assembling,
    Uploading,
    Notifying,
    Complete,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }
}

/// How the finished artifact reaches the requester. `Download` skips the
/// Notifying phase entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Notify,
    Download,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub phase: Phase,
    pub delivery: Delivery,
    pub item_count: u64,
    pub cursor: u64,
    pub artifact: Option<String>,
    pub failure: Option<String>,
    pub started_at: u64,
}

#[derive(Debug, Deserialize)]
struct StartParams {
    item_count: u64,
    #[serde(default = "default_delivery")]
    delivery: Delivery,
}

fn default_delivery() -> Delivery {
    Delivery::Notify
}

pub struct ExportJob {
    job: Option<JobState>,
}

impl ExportJob {
    fn job_response(&self) -> Response {
        match &self.job {
            Some(job) => Response::ok(json!(job)),
            None => Response::not_found(),
        }
    }

    async fn save(&self, host: &mut ActorHost) -> Result<(), HearthError> {
        match &self.job {
            Some(job) => host.store.set(JOB_KEY, &json!(job)).await,
            None => host.store.delete(JOB_KEY).await,
        }
    }

    /// Runs one pipeline step and re-arms if more work remains. Progress is
    /// persisted before the re-arm, so a replayed fire repeats at most the
    /// current step.
    async fn step(&mut self, host: &mut ActorHost) -> Result<(), HearthError> {
        let Some(job) = self.job.as_mut() else {
            return Ok(());
        };

        let mut more = true;
        match job.phase {
            Phase::Querying => {
                host.log.info("export query complete");
                job.phase = Phase::Assembling;
                job.cursor = 0;
            }
            Phase::Assembling => {
                let batch = BATCH_SIZE.min(job.item_count - job.cursor);
                job.cursor += batch;
                host.log.debug("assembled one export batch");
                if job.cursor >= job.item_count {
                    job.phase = Phase::Uploading;
                }
            }
            Phase::Uploading => {
                job.artifact = Some(format!(
                    "exports/{}/{}.zip",
                    host.instance_id(),
                    job.started_at
                ));
                job.phase = match job.delivery {
                    Delivery::Notify => Phase::Notifying,
                    Delivery::Download => Phase::Complete,
                };
                more = !job.phase.is_terminal();
            }
            Phase::Notifying => {
                host.log.info("export notification sent");
                job.phase = Phase::Complete;
                more = false;
            }
            // A fire with nothing due. Stale timers and replays land here.
            Phase::Pending | Phase::Complete | Phase::Failed => more = false,
        }

        self.save(host).await?;
        if more {
            host.alarms.schedule_in(STEP_DELAY).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Actor for ExportJob {
    const NAME: &'static str = "export_job";

    fn routes() -> Vec<Route> {
        vec![
            Route::post("/start", "start"),
            Route::get("/status", "status"),
            Route::post("/cancel", "cancel"),
        ]
    }

    async fn load(host: &mut ActorHost) -> Result<Self, HearthError> {
        Ok(Self {
            job: host.store.get_as(JOB_KEY).await?,
        })
    }

    async fn handle(
        &mut self,
        route: &'static str,
        ctx: RequestContext,
        host: &mut ActorHost,
    ) -> Result<Response, HearthError> {
        match route {
            "start" => {
                if let Some(job) = &self.job {
                    if !job.phase.is_terminal() {
                        return Ok(Response::conflict(
                            "job_active",
                            "An export is already running for this job",
                        ));
                    }
                }
                let params: StartParams = ctx.body_as()?;
                if params.item_count == 0 {
                    return Ok(Response::bad_request(
                        "empty_export",
                        "item_count must be at least 1",
                    ));
                }
                self.job = Some(JobState {
                    phase: Phase::Querying,
                    delivery: params.delivery,
                    item_count: params.item_count,
                    cursor: 0,
                    artifact: None,
                    failure: None,
                    started_at: hearth::now_ms(),
                });
                self.save(host).await?;
                host.alarms.schedule_in(STEP_DELAY).await?;
                host.log.info("export started");
                Ok(self.job_response())
            }
            "status" => Ok(self.job_response()),
            "cancel" => {
                match self.job.as_mut() {
                    Some(job) if !job.phase.is_terminal() => {
                        job.phase = Phase::Failed;
                        job.failure = Some("cancelled".to_string());
                        host.alarms.cancel().await?;
                        self.save(host).await?;
                        host.log.info("export cancelled");
                    }
                    // Cancelling a finished or absent job is a no-op.
                    _ => {}
                }
                Ok(self.job_response())
            }
            _ => Ok(Response::not_found()),
        }
    }

    async fn on_alarm(&mut self, host: &mut ActorHost) -> Result<(), HearthError> {
        self.step(host).await
    }
}

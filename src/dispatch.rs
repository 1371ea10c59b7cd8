//! The consume loop: one job at a time from the input queue to one result on
//! the output queue.
//!
//! For each delivery:
//! 1. parse the body and check the job type against the registry; a failure
//!    is a rejection (dead-lettered if configured, then acked, no result)
//! 2. resolve the model; a load failure becomes an `INTERPRETER_ERROR` result
//! 3. run one stream session
//! 4. publish the result
//! 5. ack, only after the publish succeeded
//!
//! Queue errors end `run` and are for the caller to handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::artifact::ArtifactStore;
use crate::error::JobError;
use crate::ingest::StreamTransport;
use crate::job::{Job, RejectedMessage, SessionResult};
use crate::model_cache::ModelCache;
use crate::session::{SessionSettings, StreamSession};
use crate::transport::{Delivery, JobQueue};

/// How often the idle loop checks the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub output_queue: String,
    pub dead_letter_queue: Option<String>,
    pub session: SessionSettings,
    /// Model loaded at startup.
    pub default_job_type: Option<String>,
}

/// What happened to one delivery.
#[derive(Clone, Debug, PartialEq)]
pub enum Disposition {
    Completed(SessionResult),
    Rejected(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub completed: u64,
    pub rejected: u64,
}

pub struct Dispatcher {
    cache: ModelCache,
    transport: Box<dyn StreamTransport>,
    artifacts: Option<Box<dyn ArtifactStore>>,
    config: DispatcherConfig,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        cache: ModelCache,
        transport: Box<dyn StreamTransport>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            cache,
            transport,
            artifacts: None,
            config,
            stats: DispatchStats::default(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Box<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Load the default model ahead of the first job. Failure is logged only.
    pub fn preload(&mut self) {
        let Some(job_type) = self.config.default_job_type.clone() else {
            return;
        };
        match self.cache.resolve(&job_type) {
            Ok(_) => log::info!("preloaded model for {}", job_type),
            Err(e) => log::warn!("preload failed: {}", e),
        }
    }

    /// Consume until `shutdown` is set or the queue fails.
    pub fn run(&mut self, queue: &mut dyn JobQueue, shutdown: &AtomicBool) -> Result<()> {
        log::info!("waiting for jobs");
        while !shutdown.load(Ordering::SeqCst) {
            let Some(delivery) = queue.next_delivery(POLL_INTERVAL)? else {
                continue;
            };
            self.handle(queue, &delivery)?;
        }
        log::info!(
            "dispatcher stopped: {} received, {} completed, {} rejected",
            self.stats.received,
            self.stats.completed,
            self.stats.rejected
        );
        Ok(())
    }

    /// Process one delivery through to its ack.
    ///
    /// `Err` means the broker failed and the delivery was not acked.
    pub fn handle(&mut self, queue: &mut dyn JobQueue, delivery: &Delivery) -> Result<Disposition> {
        self.stats.received += 1;
        log::info!(
            "new message {} on {}{}",
            delivery.tag,
            delivery.topic,
            if delivery.redelivered { " (redelivered)" } else { "" }
        );

        let job = match self.accept(&delivery.payload) {
            Ok(job) => job,
            Err(e) if e.is_rejection() => {
                self.reject(queue, delivery, &e)?;
                return Ok(Disposition::Rejected(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.execute(&job);
        log::info!("{} on {}: {}", job.job_type, job.source, result.kind());

        let body = serde_json::to_vec(&result.to_message(&job.job_type))
            .context("serialize result message")?;
        queue.publish(&self.config.output_queue, &body)?;
        queue.ack(delivery)?;
        self.stats.completed += 1;
        Ok(Disposition::Completed(result))
    }

    fn accept(&self, payload: &[u8]) -> Result<Job, JobError> {
        let job = Job::parse(payload)?;
        if !self.cache.registry().contains(&job.job_type) {
            return Err(JobError::UnknownJobType(job.job_type));
        }
        Ok(job)
    }

    fn reject(&mut self, queue: &mut dyn JobQueue, delivery: &Delivery, err: &JobError) -> Result<()> {
        log::warn!("rejecting message {}: {}", delivery.tag, err);
        if let Some(dead_letter) = &self.config.dead_letter_queue {
            let body = serde_json::to_vec(&RejectedMessage {
                reason: err.to_string(),
                body: String::from_utf8_lossy(&delivery.payload).into_owned(),
            })
            .context("serialize rejected message")?;
            queue.publish(dead_letter, &body)?;
            log::debug!("dead-lettered message {} to {}", delivery.tag, dead_letter);
        }
        queue.ack(delivery)?;
        self.stats.rejected += 1;
        Ok(())
    }

    fn execute(&mut self, job: &Job) -> SessionResult {
        let model = match self.cache.resolve(&job.job_type) {
            Ok(model) => model,
            Err(e) => {
                log::error!("{}", e);
                return SessionResult::InterpreterError(e.to_string());
            }
        };
        let report = StreamSession::new(self.transport.as_mut(), self.config.session)
            .with_artifacts(self.artifacts.as_deref())
            .run(job, model);
        log::debug!(
            "session for {} ended after {} frames in {} ms",
            job.source,
            report.frames_processed,
            report.elapsed.as_millis()
        );
        report.result
    }
}

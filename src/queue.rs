// The Queue Client: submit, cancel, load-one, load-recent, update-with-
// revision, plus the worker's pull-dispatch loop. Owns deduplication,
// revision discipline, and the cancellation protocol. Everything here is a
// thin layer of policy over storage.rs.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::record::{self, JobId, JobParameters, JobRecord, JobStatus};
use crate::storage::{self, Gateway};

pub struct QueueClient {
    gateway: Gateway,
    consumer_name: String,
}

/// A job and the revision its record was last observed at, handed to the
/// dispatch loop's callback.
pub struct ClaimedJob {
    pub record: JobRecord,
    pub revision: u64,
}

impl QueueClient {
    pub fn new(gateway: Gateway, consumer_name: impl Into<String>) -> Self {
        Self {
            gateway,
            consumer_name: consumer_name.into(),
        }
    }

    pub async fn submit(&self, parameters: JobParameters) -> Result<JobRecord, QueueError> {
        let id = uuid::Uuid::new_v4();
        let record = JobRecord::new(id, parameters);
        let bytes = record::encode(&record).map_err(QueueError::Submit)?;

        let records = self.gateway.record_store().await.map_err(QueueError::Submit)?;
        records.create(&record::record_key(id), bytes).await?;

        self.gateway
            .submit_stream()
            .append(id, &id.to_string())
            .await
            .map_err(QueueError::Submit)?;

        Ok(record)
    }

    pub async fn load_job(&self, id: JobId) -> Result<(JobRecord, u64), QueueError> {
        let records = self.gateway.record_store().await.map_err(QueueError::Transport)?;
        let (bytes, revision) = records.get(&record::record_key(id)).await?;
        let record = record::decode(&bytes).map_err(QueueError::BadRecord)?;
        Ok((record, revision))
    }

    pub async fn update_job(&self, record: &JobRecord, expected_revision: u64) -> Result<u64, QueueError> {
        let records = self.gateway.record_store().await.map_err(QueueError::Transport)?;
        let bytes = record::encode(record).map_err(QueueError::BadRecord)?;
        records.update(&record::record_key(record.id), bytes, expected_revision).await
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<(), QueueError> {
        let (mut record, revision) = self.load_job(id).await?;
        if record.status != JobStatus::Submitted {
            return Err(QueueError::NotCancellable(id.to_string()));
        }
        record.status = JobStatus::Cancelled;
        record.completed = Some(record::timestamp::now_rounded());
        self.update_job(&record, revision).await?;
        Ok(())
    }

    /// Walks the submit stream from `Last()` backwards, newest-first,
    /// resolving each message's job id via the record store. Skips messages
    /// lacking a header rather than failing the whole walk.
    pub async fn load_recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        let stream = self.gateway.submit_stream();
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        let last = stream.last().await.map_err(QueueError::Transport)?;
        let Some((mut seq, _)) = last else {
            return Ok(out);
        };
        loop {
            match stream.by_index(seq).await.map_err(QueueError::Transport)? {
                Some(job_id) => match self.load_job(job_id).await {
                    Ok((record, _)) => {
                        out.push(record);
                        if out.len() >= limit {
                            break;
                        }
                    }
                    Err(QueueError::NotFound(_)) => {
                        warn!("recent-jobs walk: record for {job_id} vanished, skipping");
                    }
                    Err(e) => return Err(e),
                },
                None => {
                    // Message lacked a header or was otherwise unresolvable; skip it.
                }
            }
            if seq == 1 {
                break;
            }
            seq -= 1;
        }
        Ok(out)
    }

    /// The worker's dispatch loop. Calls `on_job` once per claimed job,
    /// acknowledging the underlying message unconditionally afterwards
    /// (unless `on_job` returns a fatal error, in which case the loop
    /// terminates without acking — the message becomes eligible for
    /// redelivery on the next run).
    pub async fn dispatch_jobs<F, Fut>(&self, cancel: CancellationToken, mut on_job: F) -> anyhow::Result<()>
    where
        F: FnMut(ClaimedJob) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let consumer = self
            .gateway
            .submit_stream()
            .consumer(&self.consumer_name)
            .await
            .context("binding dispatch consumer")?;

        while !cancel.is_cancelled() {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                result = storage::fetch_one(&consumer, Duration::from_secs(1)) => result,
            };
            let message = match message {
                Ok(Some(m)) => m,
                Ok(None) => continue,
                Err(e) => {
                    warn!("fetch error, backing off 1s: {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let Some(job_id) = storage::message_job_id(&message) else {
                debug!("message missing job-id header, acking and skipping");
                message.ack().await.map_err(|e| anyhow!(e)).context("ack")?;
                continue;
            };

            let (record, revision) = match self.load_job(job_id).await {
                Ok(pair) => pair,
                Err(QueueError::NotFound(_)) | Err(QueueError::BadRecord(_)) => {
                    warn!("job {job_id} not loadable, acking and skipping");
                    message.ack().await.map_err(|e| anyhow!(e)).context("ack")?;
                    continue;
                }
                Err(e) => return Err(e).context("loading claimed job"),
            };

            if record.id != job_id {
                message.ack().await.map_err(|e| anyhow!(e)).context("ack")?;
                anyhow::bail!("store inconsistency: header job id {job_id} != record id {}", record.id);
            }

            if record.status != JobStatus::Submitted {
                debug!("job {job_id} already left Submitted ({}), acking and skipping", record.status);
                message.ack().await.map_err(|e| anyhow!(e)).context("ack")?;
                continue;
            }

            on_job(ClaimedJob { record, revision }).await?;
            message.ack().await.map_err(|e| anyhow!(e)).context("ack")?;
        }
        Ok(())
    }
}

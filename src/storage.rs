// The Storage Gateway. Thin adapter over a JetStream-backed message-stream
// backend exposing three logical stores: a submit stream (append-only,
// dedup'd), a record store (KV with per-key revision), and an artifact store
// (immutable binary objects).
//
// All three are namespaced so that multiple deployments can share a backend:
// `<ns>-jobs` names both the submit stream and the record bucket, and
// `<ns>-artifacts` names the object store.

use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
use async_nats::jetstream::{self, consumer::PullConsumer};
use futures::StreamExt as _;
use log::debug;
use tokio::fs;
use tokio::io::AsyncWriteExt as _;
use uuid::Uuid;

use crate::error::QueueError;
use crate::record::JobId;

/// Header carrying the job id on a submit-stream message.
pub const JOB_ID_HEADER: &str = "x-job-id";

#[derive(Clone)]
pub struct Gateway {
    js: jetstream::Context,
    namespace: String,
    submit_stream_name: String,
}

impl Gateway {
    pub async fn connect(nats_url: &str, namespace: &str) -> anyhow::Result<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .with_context(|| format!("connecting to {nats_url}"))?;
        let js = jetstream::new(client);
        Ok(Self {
            js,
            namespace: namespace.to_owned(),
            submit_stream_name: format!("{namespace}-jobs"),
        })
    }

    /// Like [`Self::connect`] but lets the caller use a differently-named
    /// submit stream while sharing the record and artifact stores across
    /// queues, per the namespacing rule in the spec's storage gateway design.
    pub async fn connect_with_queue(
        nats_url: &str,
        namespace: &str,
        queue_name: &str,
    ) -> anyhow::Result<Self> {
        let mut gw = Self::connect(nats_url, namespace).await?;
        gw.submit_stream_name = queue_name.to_owned();
        Ok(gw)
    }

    fn record_bucket_name(&self) -> String {
        format!("{}-jobs", self.namespace)
    }

    fn artifact_bucket_name(&self) -> String {
        format!("{}-artifacts", self.namespace)
    }

    fn submit_subject(&self) -> String {
        format!("{}.jobs.submit", self.namespace)
    }

    /// Idempotent setup: creates the submit stream, record bucket, and
    /// artifact bucket if they don't already exist. Safe to call on every
    /// worker startup.
    pub async fn init_schema(&self) -> anyhow::Result<()> {
        match self
            .js
            .get_or_create_stream(jetstream::stream::Config {
                name: self.submit_stream_name.clone(),
                subjects: vec![self.submit_subject()],
                ..Default::default()
            })
            .await
        {
            Ok(_) => debug!("submit stream {} ready", self.submit_stream_name),
            Err(e) => bail!("creating submit stream {}: {e}", self.submit_stream_name),
        }

        match self
            .js
            .create_key_value(jetstream::kv::Config {
                bucket: self.record_bucket_name(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => debug!("record bucket {} ready", self.record_bucket_name()),
            Err(e) if e.to_string().contains("already") => {
                debug!("record bucket {} already exists", self.record_bucket_name())
            }
            Err(e) => bail!("creating record bucket {}: {e}", self.record_bucket_name()),
        }

        match self
            .js
            .create_object_store(jetstream::object_store::Config {
                bucket: self.artifact_bucket_name(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => debug!("artifact bucket {} ready", self.artifact_bucket_name()),
            Err(e) if e.to_string().contains("already") => {
                debug!("artifact bucket {} already exists", self.artifact_bucket_name())
            }
            Err(e) => bail!("creating artifact bucket {}: {e}", self.artifact_bucket_name()),
        }

        Ok(())
    }

    pub fn submit_stream(&self) -> SubmitStream {
        SubmitStream { gw: self }
    }

    pub async fn record_store(&self) -> anyhow::Result<RecordStore> {
        let store = self
            .js
            .get_key_value(self.record_bucket_name())
            .await
            .with_context(|| format!("opening record bucket {}", self.record_bucket_name()))?;
        Ok(RecordStore { store })
    }

    pub async fn artifact_store(&self) -> anyhow::Result<ArtifactStore> {
        let store = self
            .js
            .get_object_store(self.artifact_bucket_name())
            .await
            .with_context(|| format!("opening artifact bucket {}", self.artifact_bucket_name()))?;
        Ok(ArtifactStore { store })
    }
}

pub struct SubmitStream<'a> {
    gw: &'a Gateway,
}

impl SubmitStream<'_> {
    /// Appends a submission event. Rejects duplicates within the stream's
    /// dedup window by setting the Nats-Msg-Id header to `dedup_key`; a
    /// duplicate publish is silently absorbed by the backend and we return
    /// the existing sequence.
    pub async fn append(&self, job_id: JobId, dedup_key: &str) -> anyhow::Result<u64> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(JOB_ID_HEADER, job_id.to_string().as_str());
        headers.insert("Nats-Msg-Id", dedup_key);

        let ack = self
            .gw
            .js
            .publish_with_headers(self.gw.submit_subject(), headers, "".into())
            .await
            .context("publishing submit event")?
            .await
            .context("awaiting submit ack")?;
        Ok(ack.sequence)
    }

    pub async fn last(&self) -> anyhow::Result<Option<(u64, JobId)>> {
        let stream = self
            .gw
            .js
            .get_stream(&self.gw.submit_stream_name)
            .await
            .context("getting submit stream")?;
        let message = match stream.get_last_raw_message_by_subject(&self.gw.submit_subject()).await {
            Ok(m) => m,
            Err(e) if e.to_string().contains("no message found") => return Ok(None),
            Err(e) => return Err(e).context("fetching last submit message"),
        };
        Ok(Some((message.sequence, header_job_id_from_map(&message.headers)?)))
    }

    pub async fn by_index(&self, seq: u64) -> anyhow::Result<Option<JobId>> {
        let stream = self
            .gw
            .js
            .get_stream(&self.gw.submit_stream_name)
            .await
            .context("getting submit stream")?;
        let message = match stream.get_raw_message(seq).await {
            Ok(m) => m,
            Err(e) if e.to_string().contains("no message found") => return Ok(None),
            Err(e) => return Err(e).context("fetching submit message by index"),
        };
        Ok(header_job_id_from_map(&message.headers).ok())
    }

    /// Binds (creating if needed) a durable pull consumer on the submit
    /// stream.
    pub async fn consumer(&self, name: &str) -> anyhow::Result<PullConsumer> {
        let stream = self
            .gw
            .js
            .get_or_create_stream(jetstream::stream::Config {
                name: self.gw.submit_stream_name.clone(),
                subjects: vec![self.gw.submit_subject()],
                ..Default::default()
            })
            .await
            .context("getting submit stream")?;
        stream
            .get_or_create_consumer(
                name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(name.to_owned()),
                    ..Default::default()
                },
            )
            .await
            .context("binding durable consumer")
    }
}

fn header_job_id(headers: &Option<async_nats::HeaderMap>) -> anyhow::Result<JobId> {
    let headers = headers.as_ref().ok_or_else(|| anyhow!("message has no headers"))?;
    header_job_id_from_map(headers)
}

fn header_job_id_from_map(headers: &async_nats::HeaderMap) -> anyhow::Result<JobId> {
    let raw = headers
        .get(JOB_ID_HEADER)
        .ok_or_else(|| anyhow!("message missing {JOB_ID_HEADER} header"))?;
    Uuid::parse_str(raw.as_str()).context("parsing job id header")
}

pub struct RecordStore {
    store: jetstream::kv::Store,
}

impl RecordStore {
    pub async fn create(&self, key: &str, bytes: Vec<u8>) -> Result<u64, QueueError> {
        self.store.create(key, bytes.into()).await.map_err(|e| {
            if e.to_string().contains("already exists") || e.to_string().contains("wrong last sequence") {
                QueueError::NotCancellable(format!("record {key} already exists"))
            } else {
                QueueError::Transport(anyhow!(e))
            }
        })
    }

    pub async fn get(&self, key: &str) -> Result<(Vec<u8>, u64), QueueError> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| QueueError::Transport(anyhow!(e)))?
            .ok_or_else(|| QueueError::NotFound(key.to_owned()))?;
        Ok((entry.value.to_vec(), entry.revision))
    }

    pub async fn update(&self, key: &str, bytes: Vec<u8>, expected_revision: u64) -> Result<u64, QueueError> {
        self.store
            .update(key, bytes.into(), expected_revision)
            .await
            .map_err(|_| QueueError::Revision {
                key: key.to_owned(),
                expected: expected_revision,
            })
    }
}

pub struct ArtifactStore {
    store: jetstream::object_store::ObjectStore,
}

impl ArtifactStore {
    pub async fn put_stream(&self, key: &str, description: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let meta = jetstream::object_store::ObjectMetadata {
            name: key.to_owned(),
            description: Some(description.to_owned()),
            ..Default::default()
        };
        self.store
            .put(meta, &mut Cursor::new(bytes))
            .await
            .with_context(|| format!("uploading artifact {key}"))?;
        Ok(())
    }

    pub async fn get_stream(&self, key: &str) -> Result<Vec<u8>, QueueError> {
        let mut object = self
            .store
            .get(key)
            .await
            .map_err(|_| QueueError::NotFound(key.to_owned()))?;
        let mut buf = Vec::new();
        tokio::io::copy(&mut object, &mut buf)
            .await
            .map_err(|e| QueueError::Transport(anyhow!(e)))?;
        Ok(buf)
    }

    pub async fn get_to_file(&self, key: &str, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.context("creating artifact destination directory")?;
        }
        let bytes = self
            .get_stream(key)
            .await
            .with_context(|| format!("downloading artifact {key}"))?;
        let mut file = fs::File::create(path).await.context("creating artifact destination file")?;
        file.write_all(&bytes).await.context("writing artifact to disk")?;
        Ok(())
    }
}

/// One fetch attempt against the durable consumer: returns at most one
/// message, or `None` on the spec's `Fetch(1, maxWait=1s)` timeout.
pub async fn fetch_one(
    consumer: &PullConsumer,
    max_wait: Duration,
) -> anyhow::Result<Option<jetstream::Message>> {
    let mut batch = consumer
        .fetch()
        .max_messages(1)
        .expires(max_wait)
        .messages()
        .await
        .context("starting fetch")?;
    match tokio::time::timeout(max_wait, batch.next()).await {
        Ok(Some(Ok(msg))) => Ok(Some(msg)),
        Ok(Some(Err(e))) => Err(anyhow!(e)).context("fetch error"),
        Ok(None) => Ok(None),
        Err(_) => Ok(None),
    }
}

pub fn message_job_id(message: &jetstream::Message) -> Option<JobId> {
    header_job_id(&message.headers).ok()
}

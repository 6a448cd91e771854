// Error taxonomy for the Queue Client and Result Ingestor boundary. Internal
// plumbing (storage.rs, worker.rs) mostly propagates with anyhow::Context;
// these variants exist where a caller needs to match on *kind*, not just
// read a message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("backend unreachable: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("revision mismatch on {key}: expected {expected}")]
    Revision { key: String, expected: u64 },

    #[error("bad record: {0}")]
    BadRecord(#[source] anyhow::Error),

    #[error("job {0} is not cancellable")]
    NotCancellable(String),

    #[error("duplicate job ids in request")]
    DuplicateJobs,

    #[error("job {0} has not reached a terminal status")]
    NotFinal(String),

    #[error("submit failed: {0}")]
    Submit(#[source] anyhow::Error),
}

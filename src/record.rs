// The record codec. Authoritative schema for a job's lifecycle state.
//
// Records are serialized as JSON: self-describing, forward-compatible (old
// readers and writers tolerate unknown/missing fields via `#[serde(default)]`),
// and deterministic for a given input (serde_json preserves struct field
// order, so two encodes of the same record produce identical bytes).

use std::fmt;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job id. Always a v4 UUID, allocated by `Submit`.
pub type JobId = Uuid;

/// Record key for a job: `jobs/<id>`.
pub fn record_key(id: JobId) -> String {
    format!("jobs/{id}")
}

/// Artifact key for the run log.
pub fn log_key(id: JobId) -> String {
    format!("jobs/{id}/log.txt")
}

/// Artifact key for the parsed-by-ingestor results file.
pub fn results_key(id: JobId) -> String {
    format!("jobs/{id}/results.txt")
}

/// Artifact key for the rendered benchmark script.
pub fn script_key(id: JobId) -> String {
    format!("jobs/{id}/run.sh")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Succeeded | Self::Cancelled)
    }

    /// Status icon, for display layers only. Not load-bearing for the core.
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Submitted => "⚪",
            Self::Running => "🟣",
            Self::Failed => "🔴",
            Self::Succeeded => "🟢",
            Self::Cancelled => "❌",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Succeeded => "SUCCEEDED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Text encoding of a Duration: an integer followed by a unit suffix
/// (`s`, `m`, `h`). We only ever need to round-trip values we ourselves
/// produced plus whatever a human typed into a config file, so we keep
/// this deliberately small rather than implementing a general duration
/// grammar.
pub mod duration_text {
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format!("{}s", d.as_secs()).serialize(s)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(d)?;
        parse(&text).map_err(D::Error::custom)
    }

    pub fn parse(text: &str) -> anyhow::Result<Duration> {
        let (num, unit) = text.split_at(
            text.find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| anyhow::anyhow!("duration {text:?} has no unit suffix"))?,
        );
        let n: u64 = num.parse().map_err(|e| anyhow::anyhow!("bad duration {text:?}: {e}"))?;
        let secs = match unit {
            "s" => n,
            "m" => n * 60,
            "h" => n * 3600,
            other => anyhow::bail!("unknown duration unit {other:?} in {text:?}"),
        };
        Ok(Duration::from_secs(secs))
    }
}

/// UTC timestamp rounded to whole seconds, encoded as `YYYY-MM-DDTHH:MM:SSZ`.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match t {
            Some(t) => t.trunc_subsecs(0).format("%Y-%m-%dT%H:%M:%SZ").to_string().serialize(s),
            None => "".serialize(s),
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(d)?;
        if text.is_empty() {
            return Ok(None);
        }
        NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%SZ")
            .map(|n| Some(n.and_utc()))
            .map_err(D::Error::custom)
    }

    pub fn now_rounded() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameters {
    pub git_remote: String,
    pub git_ref: String,
    #[serde(default)]
    pub tests_sub_dir: String,
    #[serde(default)]
    pub tests_filter_expr: String,
    #[serde(default = "default_reps")]
    pub reps: u32,
    #[serde(with = "duration_text", default = "default_test_min_runtime")]
    pub test_min_runtime: std::time::Duration,
    #[serde(with = "duration_text", default = "default_timeout")]
    pub timeout: std::time::Duration,
    #[serde(default)]
    pub skip_cleanup: bool,
    #[serde(default)]
    pub username: String,
    // Older records call this GoPath; newer ones call it ToolchainPath. Both
    // names decode to the same field so reports can open records written by
    // either encoder.
    #[serde(default, alias = "GoPath", rename = "ToolchainPath")]
    pub toolchain_path: Option<String>,
    #[serde(default)]
    pub cleanup_cmd: Option<String>,
}

fn default_reps() -> u32 {
    1
}

fn default_test_min_runtime() -> std::time::Duration {
    std::time::Duration::from_secs(1)
}

fn default_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(30 * 60)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    #[serde(default)]
    pub hostname: String,
    /// `<os>-<release>-<arch>` triple, e.g. `linux-6.8.0-x86_64`.
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub parameters: JobParameters,
    #[serde(default)]
    pub worker_info: WorkerInfo,
    #[serde(with = "timestamp")]
    pub created: Option<DateTime<Utc>>,
    #[serde(with = "timestamp", default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(with = "timestamp", default)]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub go_version: String,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub results: String,
    #[serde(default)]
    pub script: String,
}

impl JobRecord {
    pub fn new(id: JobId, parameters: JobParameters) -> Self {
        Self {
            id,
            status: JobStatus::Submitted,
            parameters,
            worker_info: WorkerInfo::default(),
            created: Some(timestamp::now_rounded()),
            started: None,
            completed: None,
            sha: String::new(),
            go_version: String::new(),
            log: String::new(),
            results: String::new(),
            script: String::new(),
        }
    }
}

/// Encodes a record deterministically. Two calls on an equal record produce
/// identical bytes.
pub fn encode(record: &JobRecord) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(record).context("encoding job record")
}

/// Decodes a record, tolerating fields an older writer never produced.
pub fn decode(bytes: &[u8]) -> anyhow::Result<JobRecord> {
    serde_json::from_slice(bytes).with_context(|| "decoding job record".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> JobParameters {
        JobParameters {
            git_remote: "https://github.com/acme/widgets".into(),
            git_ref: "main".into(),
            tests_sub_dir: "bench".into(),
            tests_filter_expr: "BenchmarkFoo".into(),
            reps: 3,
            test_min_runtime: std::time::Duration::from_secs(1),
            timeout: std::time::Duration::from_secs(300),
            skip_cleanup: false,
            username: "alice".into(),
            toolchain_path: None,
            cleanup_cmd: None,
        }
    }

    #[test]
    fn round_trip() {
        let id = Uuid::new_v4();
        let record = JobRecord::new(id, sample_params());
        let bytes = encode(&record).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.id, record.id);
        assert_eq!(decoded.status, record.status);
        assert_eq!(decoded.parameters, record.parameters);
        assert_eq!(decoded.created, record.created);
    }

    #[test]
    fn encode_is_deterministic() {
        let id = Uuid::new_v4();
        let record = JobRecord::new(id, sample_params());
        assert_eq!(encode(&record).unwrap(), encode(&record).unwrap());
    }

    #[test]
    fn decode_tolerates_missing_fields() {
        let id = Uuid::new_v4();
        let minimal = serde_json::json!({
            "id": id,
            "status": "SUBMITTED",
            "parameters": {
                "git_remote": "https://example.com/repo",
                "git_ref": "main",
            },
            "created": "",
        });
        let bytes = serde_json::to_vec(&minimal).unwrap();
        let decoded = decode(&bytes).expect("old-shaped record should decode");
        assert_eq!(decoded.status, JobStatus::Submitted);
        assert_eq!(decoded.parameters.reps, 1);
        assert!(decoded.log.is_empty());
    }

    #[test]
    fn go_path_alias_decodes_into_toolchain_path() {
        let id = Uuid::new_v4();
        let old = serde_json::json!({
            "id": id,
            "status": "SUBMITTED",
            "parameters": {
                "git_remote": "https://example.com/repo",
                "git_ref": "main",
                "GoPath": "/usr/local/go1.22",
            },
            "created": "",
        });
        let bytes = serde_json::to_vec(&old).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.parameters.toolchain_path.as_deref(), Some("/usr/local/go1.22"));
    }

    #[test]
    fn timestamp_parses_literal_z_suffix() {
        // The wire format has a literal "Z", not a parseable offset, so this
        // must go through NaiveDateTime rather than DateTime::parse_from_str.
        let record = serde_json::json!({
            "id": Uuid::new_v4(),
            "status": "SUBMITTED",
            "parameters": {"git_remote": "https://example.com/repo", "git_ref": "main"},
            "created": "2024-03-05T12:34:56Z",
        });
        let bytes = serde_json::to_vec(&record).unwrap();
        let decoded = decode(&bytes).expect("literal Z timestamp should parse");
        let created = decoded.created.expect("created should be set");
        assert_eq!(created.format("%Y-%m-%dT%H:%M:%SZ").to_string(), "2024-03-05T12:34:56Z");
    }

    #[test]
    fn duration_text_round_trips() {
        assert_eq!(duration_text::parse("1s").unwrap().as_secs(), 1);
        assert_eq!(duration_text::parse("3h").unwrap().as_secs(), 3 * 3600);
        assert!(duration_text::parse("nope").is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode(b"not json").unwrap_err();
        assert!(err.to_string().contains("decoding job record"));
    }
}

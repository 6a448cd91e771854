// The Worker Engine. Claims one job at a time, drives the state machine,
// stages a run directory, spawns the benchmark subprocess, streams its
// output to a log file, captures side-files, and uploads artifacts. Owns the
// git-remote allowlist filter and run-directory cleanup.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use log::{error, info, warn};
use regex::Regex;
use tokio::fs;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::process::ExitStatusExt as _;
use crate::queue::{ClaimedJob, QueueClient};
use crate::record::{self, JobRecord, JobStatus, WorkerInfo};
use crate::storage::Gateway;

const BENCHMARK_SCRIPT_TEMPLATE: &str = include_str!("../scripts/benchmark.sh.tmpl");

pub struct WorkerConfig {
    pub jobs_dir: Option<PathBuf>,
    pub git_remote_allowlist: Vec<Regex>,
    pub toolchain_path: Option<String>,
    pub worker_version: String,
}

pub struct Worker {
    queue: QueueClient,
    gateway: Gateway,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: QueueClient, gateway: Gateway, config: WorkerConfig) -> Self {
        Self { queue, gateway, config }
    }

    /// Runs the dispatch loop until `cancel` fires. Matches the spec's
    /// "finish the current job's update cycle, then stop" cancellation
    /// semantics: in-flight subprocesses are never interrupted by this.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.queue
            .dispatch_jobs(cancel, |claimed| self.process_job(claimed))
            .await
    }

    async fn process_job(&self, claimed: ClaimedJob) -> anyhow::Result<()> {
        let ClaimedJob { mut record, revision } = claimed;
        let job_id = record.id;
        info!("claimed job {job_id}");

        if !self.allowlist_permits(&record.parameters.git_remote) {
            warn!("job {job_id}: git remote {:?} rejected by allowlist", record.parameters.git_remote);
            return self.fail_without_running(record, revision).await;
        }

        record.status = JobStatus::Running;
        record.started = Some(record::timestamp::now_rounded());
        record.worker_info = self.worker_info().await;
        let revision1 = match self.queue.update_job(&record, revision).await {
            Ok(r) => r,
            Err(QueueError::Revision { .. }) => {
                // Lost the race to claim this job (another worker, or a
                // concurrent cancellation, won). Transient per spec.md §7 -
                // report and let the dispatch loop ack and move on rather
                // than tearing down the whole worker.
                warn!("job {job_id}: lost the race stamping Running, leaving it alone");
                return Ok(());
            }
            Err(e) => return Err(e).context("stamping job Running"),
        };

        let run = self.run_job(&record).await;

        record.completed = Some(record::timestamp::now_rounded());
        match &run {
            Ok(outcome) => {
                record.sha = outcome.sha.clone();
                record.go_version = outcome.go_version.clone();
                record.status = JobStatus::Succeeded;
            }
            Err(e) => {
                warn!("job {job_id} run failed: {e:#}");
                record.status = JobStatus::Failed;
            }
        }

        let run_dir = run.as_ref().ok().map(|o| o.run_dir.clone());
        let log_bytes = run
            .as_ref()
            .ok()
            .map(|o| o.log_bytes.clone())
            .or_else(|| run.as_ref().err().map(|e| format!("{e:#}\n").into_bytes()))
            .unwrap_or_default();
        let results_bytes = run.as_ref().ok().and_then(|o| o.results_bytes.clone());
        let script_bytes = run.as_ref().ok().map(|o| o.script_bytes.clone());

        if self.upload_artifacts(&mut record, log_bytes, results_bytes, script_bytes).await.is_err() {
            record.status = JobStatus::Failed;
        }

        if let Some(dir) = run_dir {
            if !record.parameters.skip_cleanup {
                if let Err(e) = fs::remove_dir_all(&dir).await {
                    warn!("job {job_id}: couldn't remove run directory {dir:?}: {e}");
                }
            }
        }

        match self.queue.update_job(&record, revision1).await {
            Ok(_) => {}
            Err(e) => error!("job {job_id}: final update lost the race ({e:#}), not retrying"),
        }

        Ok(())
    }

    async fn fail_without_running(&self, mut record: JobRecord, revision: u64) -> anyhow::Result<()> {
        record.status = JobStatus::Failed;
        record.started = Some(record::timestamp::now_rounded());
        record.completed = Some(record::timestamp::now_rounded());
        record.worker_info = self.worker_info().await;
        let log = format!(
            "job rejected: git remote {:?} did not match any configured allowlist pattern\n",
            record.parameters.git_remote
        )
        .into_bytes();
        let revision1 = match self.queue.update_job(&record, revision).await {
            Ok(r) => r,
            Err(QueueError::Revision { .. }) => {
                warn!("job {}: lost the race stamping allowlist rejection, leaving it alone", record.id);
                return Ok(());
            }
            Err(e) => return Err(e).context("stamping allowlist rejection"),
        };
        if self.upload_artifacts(&mut record, log, None, None).await.is_err() {
            record.status = JobStatus::Failed;
        }
        if let Err(e) = self.queue.update_job(&record, revision1).await {
            error!("job {}: final update after allowlist rejection lost the race ({e:#})", record.id);
        }
        Ok(())
    }

    fn allowlist_permits(&self, git_remote: &str) -> bool {
        if self.config.git_remote_allowlist.is_empty() {
            return true;
        }
        self.config.git_remote_allowlist.iter().any(|re| re.is_match(git_remote))
    }

    async fn worker_info(&self) -> WorkerInfo {
        let (hostname, uname) = host_identity();
        WorkerInfo {
            hostname,
            uname,
            version: self.config.worker_version.clone(),
        }
    }

    async fn run_job(&self, record: &JobRecord) -> anyhow::Result<RunOutcome> {
        let root = self.config.jobs_dir.clone().unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&root).await.context("creating jobs-dir root")?;
        let run_dir = root.join(format!("go-bench-away-job-{}-{}", record.id, std::process::id()));
        fs::create_dir(&run_dir).await.context("creating run directory")?;

        let script_text = render_script(record, self.config.toolchain_path.as_deref());
        let script_path = run_dir.join("run.sh");
        fs::write(&script_path, &script_text).await.context("writing run script")?;
        set_executable(&script_path).await?;

        let log_path = run_dir.join("log.txt");
        let log_bytes = run_and_tee(&script_path, &run_dir, &log_path, record.parameters.timeout).await?;

        let sha = read_side_file(&run_dir.join("sha.txt")).await;
        let go_version = read_side_file(&run_dir.join("go_version.txt")).await;
        let results_bytes = fs::read(run_dir.join("results.txt")).await.ok();

        Ok(RunOutcome {
            run_dir,
            sha,
            go_version,
            log_bytes,
            results_bytes,
            script_bytes: script_text.into_bytes(),
        })
    }

    async fn upload_artifacts(
        &self,
        record: &mut JobRecord,
        log_bytes: Vec<u8>,
        results_bytes: Option<Vec<u8>>,
        script_bytes: Option<Vec<u8>>,
    ) -> anyhow::Result<()> {
        let artifacts = self
            .gateway
            .artifact_store()
            .await
            .context("opening artifact store")?;

        let mut any_failed = false;

        match artifacts.put_stream(&record::log_key(record.id), "worker log", &log_bytes).await {
            Ok(()) => record.log = record::log_key(record.id),
            Err(e) => {
                warn!("job {}: uploading log failed: {e:#}", record.id);
                any_failed = true;
            }
        }

        if let Some(bytes) = results_bytes {
            match artifacts.put_stream(&record::results_key(record.id), "benchmark results", &bytes).await {
                Ok(()) => record.results = record::results_key(record.id),
                Err(e) => {
                    warn!("job {}: uploading results failed: {e:#}", record.id);
                    any_failed = true;
                }
            }
        }

        if let Some(bytes) = script_bytes {
            match artifacts.put_stream(&record::script_key(record.id), "rendered run script", &bytes).await {
                Ok(()) => record.script = record::script_key(record.id),
                Err(e) => {
                    warn!("job {}: uploading script failed: {e:#}", record.id);
                    any_failed = true;
                }
            }
        }

        if any_failed {
            anyhow::bail!("one or more artifact uploads failed");
        }
        Ok(())
    }

}

struct RunOutcome {
    run_dir: PathBuf,
    sha: String,
    go_version: String,
    log_bytes: Vec<u8>,
    results_bytes: Option<Vec<u8>>,
    script_bytes: Vec<u8>,
}

fn render_script(record: &JobRecord, default_toolchain_path: Option<&str>) -> String {
    let p = &record.parameters;
    let toolchain_path = p.toolchain_path.as_deref().or(default_toolchain_path).unwrap_or("");
    BENCHMARK_SCRIPT_TEMPLATE
        .replace("{{GIT_REMOTE}}", &shell_quote(&p.git_remote))
        .replace("{{GIT_REF}}", &shell_quote(&p.git_ref))
        .replace("{{TESTS_SUBDIR}}", &shell_quote(&p.tests_sub_dir))
        .replace("{{TESTS_FILTER}}", &shell_quote(&p.tests_filter_expr))
        .replace("{{REPS}}", &p.reps.to_string())
        .replace("{{MIN_RUNTIME}}", &format!("{}s", p.test_min_runtime.as_secs()))
        .replace("{{TIMEOUT}}", &format!("{}s", p.timeout.as_secs()))
        .replace("{{TOOLCHAIN_PATH}}", &shell_quote(toolchain_path))
        .replace("{{CLEANUP_CMD}}", p.cleanup_cmd.as_deref().unwrap_or(""))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    let mut perms = fs::metadata(path).await?.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms).await.context("chmod run script")
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

async fn read_side_file(path: &Path) -> String {
    match fs::read_to_string(path).await {
        Ok(s) => s.trim().to_owned(),
        Err(_) => "?".to_owned(),
    }
}

/// Spawns the script, tee'ing its stdout/stderr to `log_path` and to the
/// worker's own stdio, bounded by `timeout`. Returns the full tee'd bytes
/// written to the log.
async fn run_and_tee(
    script_path: &Path,
    cwd: &Path,
    log_path: &Path,
    timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let mut log_file = fs::File::create(log_path).await.context("creating log file")?;

    let mut child = Command::new(script_path)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning benchmark script")?;

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let (stdout_tx, mut stdout_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(16);
    let (stderr_tx, mut stderr_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(16);

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stderr_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut tee_buf = Vec::new();
    let wait_fut = async {
        let mut stdout_done = false;
        let mut stderr_done = false;
        loop {
            tokio::select! {
                chunk = stdout_rx.recv(), if !stdout_done => match chunk {
                    Some(bytes) => {
                        tokio::io::stdout().write_all(&bytes).await.ok();
                        log_file.write_all(&bytes).await.ok();
                        tee_buf.extend_from_slice(&bytes);
                    }
                    None => stdout_done = true,
                },
                chunk = stderr_rx.recv(), if !stderr_done => match chunk {
                    Some(bytes) => {
                        tokio::io::stderr().write_all(&bytes).await.ok();
                        log_file.write_all(&bytes).await.ok();
                        tee_buf.extend_from_slice(&bytes);
                    }
                    None => stderr_done = true,
                },
                else => break,
            }
        }
        child.wait().await
    };

    let status = match tokio::time::timeout(timeout, wait_fut).await {
        Ok(status) => status.context("waiting for benchmark script")?,
        Err(_) => {
            anyhow::bail!("benchmark script exceeded its {:?} timeout", timeout);
        }
    };

    log_file.flush().await.ok();

    let code = status.code_not_killed().context("benchmark script")?;
    if code != 0 {
        anyhow::bail!("benchmark script exited with status {code}");
    }
    Ok(tee_buf)
}

#[cfg(target_os = "linux")]
fn host_identity() -> (String, String) {
    use nix::sys::utsname::uname;
    match uname() {
        Ok(uts) => {
            let hostname = uts.nodename().to_string_lossy().into_owned();
            let uname_str = format!(
                "{}-{}-{}",
                uts.sysname().to_string_lossy().to_lowercase(),
                uts.release().to_string_lossy(),
                uts.machine().to_string_lossy()
            );
            (hostname, uname_str)
        }
        Err(_) => ("?".to_owned(), "?".to_owned()),
    }
}

#[cfg(not(target_os = "linux"))]
fn host_identity() -> (String, String) {
    ("?".to_owned(), "?".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::JobParameters;

    fn sample_record() -> JobRecord {
        let params = JobParameters {
            git_remote: "https://github.com/acme/widgets".into(),
            git_ref: "main".into(),
            tests_sub_dir: "bench".into(),
            tests_filter_expr: "BenchmarkFoo".into(),
            reps: 3,
            test_min_runtime: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            skip_cleanup: false,
            username: "alice".into(),
            toolchain_path: None,
            cleanup_cmd: None,
        };
        JobRecord::new(uuid::Uuid::new_v4(), params)
    }

    #[test]
    fn render_script_substitutes_all_placeholders() {
        let record = sample_record();
        let rendered = render_script(&record, Some("/usr/local/go1.22"));
        assert!(!rendered.contains("{{"));
        assert!(rendered.contains("acme/widgets"));
        assert!(rendered.contains("/usr/local/go1.22"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}

use std::io::Write as _;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use tempfile::NamedTempFile;
use test_bin::get_test_bin;
use tokio::process::Command;

fn wait_for<F>(mut predicate: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate().context("timeout predicate failed")? {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    bail!("timeout after {:?}", timeout)
}

fn write_config(contents: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f
}

// The worker connects to its backend before doing anything else. Pointed at
// a URL nothing is listening on, it should fail fast rather than hang
// forever retrying - there is no such thing as "connect later" in this
// design, the worker needs a live backend to even bind its durable consumer.
#[tokio::test]
async fn worker_exits_promptly_when_backend_unreachable() {
    let config = write_config(
        r#"
        nats_url = "nats://127.0.0.1:1"
        namespace = "integration-test"
        "#,
    );

    let mut cmd: Command = get_test_bin("benchaway").into();
    let mut child = cmd
        .args(["--config", config.path().to_str().unwrap()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn worker binary");

    wait_for(
        || Ok(child.try_wait().context("polling child status")?.is_some()),
        Duration::from_secs(10),
    )
    .expect("worker should exit instead of hanging when it can't reach its backend");

    let status = child.try_wait().unwrap().expect("already polled Some above");
    assert!(!status.success(), "worker should exit non-zero on connect failure");
}

#[tokio::test]
async fn worker_rejects_config_with_unknown_fields() {
    let config = write_config(
        r#"
        nats_url = "nats://127.0.0.1:1"
        namespace = "integration-test"
        this_field_does_not_exist = true
        "#,
    );

    let mut cmd: Command = get_test_bin("benchaway").into();
    let status = cmd
        .args(["--config", config.path().to_str().unwrap()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .expect("failed to spawn worker binary");

    assert!(!status.success(), "unknown config fields should be rejected before connecting");
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use regex::Regex;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    nats_url: String,
    namespace: String,
    #[serde(default)]
    queue_name: Option<String>,
    #[serde(default)]
    consumer_name: Option<String>,
    #[serde(default)]
    jobs_dir: Option<PathBuf>,
    #[serde(default)]
    git_remote_allowlist: Vec<String>,
    #[serde(default)]
    toolchain_path: Option<String>,
}

#[derive(Debug)]
pub struct Config {
    pub nats_url: String,
    pub namespace: String,
    pub queue_name: Option<String>,
    pub consumer_name: String,
    pub jobs_dir: Option<PathBuf>,
    pub git_remote_allowlist: Vec<Regex>,
    pub toolchain_path: Option<String>,
}

pub fn load(config_path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(config_path).context("couldn't read config")?;
    let raw: RawConfig = toml::from_str(&content).context("couldn't parse config")?;

    let git_remote_allowlist = raw
        .git_remote_allowlist
        .iter()
        .map(|pattern| Regex::new(pattern).with_context(|| format!("bad allowlist pattern {pattern:?}")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Config {
        nats_url: raw.nats_url,
        namespace: raw.namespace,
        queue_name: raw.queue_name,
        consumer_name: raw.consumer_name.unwrap_or_else(|| "benchaway-worker".to_owned()),
        jobs_dir: raw.jobs_dir,
        git_remote_allowlist,
        toolchain_path: raw.toolchain_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_minimal_config() {
        let f = write_config(
            r#"
            nats_url = "nats://localhost:4222"
            namespace = "acme"
            "#,
        );
        let config = load(f.path()).unwrap();
        assert_eq!(config.namespace, "acme");
        assert_eq!(config.consumer_name, "benchaway-worker");
        assert!(config.git_remote_allowlist.is_empty());
    }

    #[test]
    fn compiles_allowlist_patterns() {
        let f = write_config(
            r#"
            nats_url = "nats://localhost:4222"
            namespace = "acme"
            git_remote_allowlist = ["^https://github\\.com/acme/"]
            "#,
        );
        let config = load(f.path()).unwrap();
        assert!(config.git_remote_allowlist[0].is_match("https://github.com/acme/widgets"));
        assert!(!config.git_remote_allowlist[0].is_match("https://github.com/evil/repo.git"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let f = write_config(
            r#"
            nats_url = "nats://localhost:4222"
            namespace = "acme"
            bogus_field = true
            "#,
        );
        assert!(load(f.path()).is_err());
    }
}

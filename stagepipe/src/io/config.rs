//! Engine settings stored in a TOML file (`stagepipe.toml` by default).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::process::DEFAULT_OUTPUT_LIMIT_BYTES;

/// Engine settings (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below,
/// which suit a MOSIX cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Console verbosity; pipeline log lines with a higher level are hidden.
    pub verbosity: u8,

    /// Left column width for check lines.
    pub left_width: usize,

    /// Right column width for check lines.
    pub right_width: usize,

    /// Default barrier poll interval in seconds.
    pub poll_interval_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Kill local synchronous commands after this many seconds. Unset means
    /// wait forever. Never applies to barriers.
    pub command_timeout_secs: Option<u64>,

    /// Log each command line before running it.
    pub echo_commands: bool,

    /// Post captured stdout of each local command to the pipeline log.
    pub post_stdout: bool,

    /// Post captured stderr of each local command to the pipeline log.
    pub post_stderr: bool,

    /// Tee every pipeline log line to this file.
    pub log_file: Option<PathBuf>,

    pub cluster: ClusterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterSettings {
    /// Template wrapping a per-target command for submission. Sees `command`,
    /// `tag`, `target`, `stage` and the pipeline vars.
    pub submit: String,

    /// Template for the outstanding-job count query. Sees `tag`.
    pub count_query: String,

    /// Detach the submit command instead of waiting for it. The submit exit
    /// code is then unknown, so a rejected job goes unnoticed until the
    /// barrier reads its count.
    pub detach: bool,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            submit: "mosbatch -q -J{{ tag }} {{ command }}".to_string(),
            count_query: "mosq listall | grep {{ tag }} | wc -l".to_string(),
            detach: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verbosity: 0,
            left_width: 60,
            right_width: 20,
            poll_interval_secs: 10,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            command_timeout_secs: None,
            echo_commands: false,
            post_stdout: true,
            post_stderr: true,
            log_file: None,
            cluster: ClusterSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.command_timeout_secs == Some(0) {
            return Err(anyhow!("command_timeout_secs must be > 0 when set"));
        }
        if self.cluster.submit.trim().is_empty() {
            return Err(anyhow!("cluster.submit must be non-empty"));
        }
        if !self.cluster.submit.contains("command") {
            return Err(anyhow!("cluster.submit must reference {{{{ command }}}}"));
        }
        if self.cluster.count_query.trim().is_empty() {
            return Err(anyhow!("cluster.count_query must be non-empty"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stagepipe.toml");
        fs::write(&path, "poll_interval_secs = 30\n[cluster]\ndetach = true\n").expect("write");
        let loaded = load_settings(&path).expect("load");
        assert_eq!(loaded.poll_interval(), Duration::from_secs(30));
        assert!(loaded.cluster.detach);
        assert_eq!(loaded.cluster.count_query, ClusterSettings::default().count_query);
        assert_eq!(loaded.left_width, 60);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let settings = Settings {
            poll_interval_secs: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn submit_without_command_is_rejected() {
        let mut settings = Settings::default();
        settings.cluster.submit = "mosbatch -q".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("cluster.submit"));
    }
}

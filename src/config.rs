//! Host configuration
//!
//! Loaded once from a TOML file and passed by reference to every component.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable consulted when no `--config` is given
pub const CONFIG_ENV: &str = "GEP_HOST_CONFIG";

/// Fallback config location, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/host.toml";

/// Immutable host configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Root holding the programs/runs/libs/files areas
    pub root: PathBuf,
    /// Name used in notification subjects
    pub service_name: String,
    /// Host and port used to build links in notifications
    pub host_name: String,
    pub port: u16,
    /// Shell used for every external step (`<shell> -c <script>`)
    pub shell: String,
    /// conda executable
    pub conda: String,
    /// Prefix that activates a named environment, e.g. `conda activate `
    pub activate: String,
    /// Pattern used to pull notification addresses out of free text
    pub email_pattern: String,
    pub admission: AdmissionConfig,
    pub supervisor: SupervisorConfig,
    pub notify: NotifyConfig,
    /// Absolute path of the file this config was loaded from
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// CPU admission settings for run workers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Runs are held back while CPU utilization (percent) is above this
    pub cpu_threshold: f32,
    pub sample_window_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long a terminated worker gets before SIGKILL
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub sendmail: String,
    /// Envelope sender; defaults to `gep_host_service@<host_name>`
    pub sender: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            service_name: "GEP host".into(),
            host_name: "localhost".into(),
            port: 5000,
            shell: "/bin/bash".into(),
            conda: "conda".into(),
            activate: "conda activate ".into(),
            email_pattern: r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}".into(),
            admission: AdmissionConfig::default(),
            supervisor: SupervisorConfig::default(),
            notify: NotifyConfig::default(),
            source_path: None,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 50.0,
            sample_window_ms: 500,
            poll_interval_ms: 2000,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 10,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sendmail: "sendmail".into(),
            sender: None,
        }
    }
}

impl HostConfig {
    /// Load configuration from a TOML file.
    ///
    /// A relative `root` is resolved against the directory of the file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;

        let source = fs::canonicalize(path)
            .with_context(|| format!("Failed to resolve config path {}", path.display()))?;
        if config.root.is_relative() {
            if let Some(dir) = source.parent() {
                config.root = dir.join(&config.root);
            }
        }
        config.source_path = Some(source);
        Ok(config)
    }

    /// Resolve the config path from the CLI flag, then the environment
    pub fn resolve_path(cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Config rooted at `root` with every other field defaulted
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn programs_dir(&self) -> PathBuf {
        self.root.join("programs")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn libs_dir(&self) -> PathBuf {
        self.root.join("libs")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn programs_table(&self) -> PathBuf {
        self.programs_dir().join("program_details.csv")
    }

    pub fn runs_table(&self) -> PathBuf {
        self.runs_dir().join("run_details.csv")
    }

    pub fn libs_table(&self) -> PathBuf {
        self.libs_dir().join("lib_details.csv")
    }

    pub fn files_table(&self) -> PathBuf {
        self.root.join("file_data.csv")
    }

    /// Workspace of an installed program
    pub fn program_dir(&self, program: &str) -> PathBuf {
        self.programs_dir().join(program)
    }

    /// Workspace of a single run
    pub fn run_dir(&self, program: &str, purpose: &str) -> PathBuf {
        self.runs_dir().join(program).join(purpose)
    }

    /// Link to a run's page, used in notifications
    pub fn run_link(&self, run_id: &str) -> String {
        format!("http://{}:{}/runs#{}", self.host_name, self.port, run_id)
    }

    pub fn sample_window(&self) -> Duration {
        Duration::from_millis(self.admission.sample_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.admission.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.stop_timeout_secs)
    }

    /// Script prefix that activates the environment of `program`
    pub fn activate_env(&self, program: &str) -> String {
        format!("{}{}", self.activate, program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_resolves_relative_root() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
root = "state"
host_name = "calc01"
port = 8080

[admission]
cpu_threshold = 75.0
"#
        )
        .unwrap();

        let config = HostConfig::load(file.path()).unwrap();
        let dir = fs::canonicalize(file.path()).unwrap();
        assert_eq!(config.root, dir.parent().unwrap().join("state"));
        assert_eq!(config.admission.cpu_threshold, 75.0);
        // untouched sections keep their defaults
        assert_eq!(config.admission.poll_interval_ms, 2000);
        assert_eq!(config.supervisor.stop_timeout_secs, 10);
        assert_eq!(config.run_link("foo__t1"), "http://calc01:8080/runs#foo__t1");
    }

    #[test]
    fn test_load_rejects_bad_types() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();
        assert!(HostConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_layout() {
        let config = HostConfig::with_root("/srv/gep");
        assert_eq!(
            config.programs_table(),
            PathBuf::from("/srv/gep/programs/program_details.csv")
        );
        assert_eq!(config.run_dir("foo", "t1"), PathBuf::from("/srv/gep/runs/foo/t1"));
        assert_eq!(config.activate_env("foo"), "conda activate foo");
    }
}

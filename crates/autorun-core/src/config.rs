use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult, IoResultExt};

pub const AUTORUN_ENV_HOST: &str = "AUTORUN_HOST";
pub const AUTORUN_ENV_PORT: &str = "AUTORUN_PORT";
pub const AUTORUN_ENV_PYTHON: &str = "AUTORUN_PYTHON";
pub const AUTORUN_ENV_HEALTH_TIMEOUT_MS: &str = "AUTORUN_HEALTH_TIMEOUT_MS";
pub const AUTORUN_ENV_REQUEST_TIMEOUT_MS: &str = "AUTORUN_REQUEST_TIMEOUT_MS";
pub const AUTORUN_ENV_SHUTDOWN_GRACE_MS: &str = "AUTORUN_SHUTDOWN_GRACE_MS";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_EXPECTED_SERVICE: &str = "Python Flask Backend";
const DEFAULT_PROJECT_ROOT_HINT: &str = "ConversationalChatbot";
const DEFAULT_ARCHIVE_HINTS: &[&str] = &[
    "assistant-BgMWbAffC61FDkxjR9jiaQ-ConversationalChatbot.zip",
    "ConversationalChatbot.zip",
    "genai_project.zip",
];

/// Everything the harness needs to know about a deployment. Host, port and
/// the file-location conventions are fixed per deployment, so every field has
/// a default and a config file only needs to name what differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub layout: LayoutConventions,
    pub service: ServiceConventions,
    pub runtime: RuntimeSettings,
    pub timeouts: TimeoutSettings,
    pub report: ReportSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConventions {
    pub archive_extension: String,
    pub archive_name_hints: Vec<String>,
    pub project_root_hint: String,
    pub entry_point: String,
    pub manifest: String,
}

impl Default for LayoutConventions {
    fn default() -> Self {
        Self {
            archive_extension: "zip".to_string(),
            archive_name_hints: DEFAULT_ARCHIVE_HINTS.iter().map(|s| s.to_string()).collect(),
            project_root_hint: DEFAULT_PROJECT_ROOT_HINT.to_string(),
            entry_point: "app.py".to_string(),
            manifest: "requirements.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConventions {
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub chat_path: String,
    pub expected_service: String,
    pub request_field: String,
    pub response_field: String,
    /// Directories, relative to the service dir, searched in order for the
    /// persisted session artifact.
    pub output_dirs: Vec<String>,
    pub session_file_prefix: String,
    pub session_file_suffix: String,
    pub process_log: String,
}

impl Default for ServiceConventions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            health_path: "/health".to_string(),
            chat_path: "/chat".to_string(),
            expected_service: DEFAULT_EXPECTED_SERVICE.to_string(),
            request_field: "user_message".to_string(),
            response_field: "assistant_response".to_string(),
            output_dirs: vec!["output".to_string()],
            session_file_prefix: "session_".to_string(),
            session_file_suffix: ".json".to_string(),
            process_log: "server.log".to_string(),
        }
    }
}

impl ServiceConventions {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        join_url(&self.base_url(), &self.health_path)
    }

    pub fn chat_url(&self) -> String {
        join_url(&self.base_url(), &self.chat_path)
    }

    pub fn session_file_name(&self, session_id: &str) -> String {
        format!(
            "{}{}{}",
            self.session_file_prefix, session_id, self.session_file_suffix
        )
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Host interpreter used to create the isolated environment.
    pub python: String,
    pub env_dir_name: String,
    pub baseline_packages: Vec<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            env_dir_name: ".venv_autorun".to_string(),
            baseline_packages: vec![
                "pip".to_string(),
                "setuptools".to_string(),
                "wheel".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub port_probe_ms: u64,
    pub health_probe_ms: u64,
    pub health_timeout_ms: u64,
    pub health_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub settle_ms: u64,
    pub artifact_wait_ms: u64,
    pub artifact_poll_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            port_probe_ms: 500,
            health_probe_ms: 2_000,
            health_timeout_ms: 60_000,
            health_interval_ms: 500,
            request_timeout_ms: 10_000,
            settle_ms: 500,
            artifact_wait_ms: 10_000,
            artifact_poll_ms: 250,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl TimeoutSettings {
    pub fn port_probe(&self) -> Duration {
        Duration::from_millis(self.port_probe_ms)
    }

    pub fn health_probe(&self) -> Duration {
        Duration::from_millis(self.health_probe_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn artifact_wait(&self) -> Duration {
        Duration::from_millis(self.artifact_wait_ms)
    }

    pub fn artifact_poll(&self) -> Duration {
        Duration::from_millis(self.artifact_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    pub filename: String,
    pub log_tail_lines: usize,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            filename: "automation_results.json".to_string(),
            log_tail_lines: 50,
        }
    }
}

impl HarnessConfig {
    /// Defaults, then the optional file (YAML or JSON), then environment
    /// overrides. The result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> HarnessResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let raw = fs::read_to_string(path)
            .io_context(|| format!("failed reading config {}", path.display()))?;
        // serde_yaml accepts JSON documents as well.
        serde_yaml::from_str(&raw).map_err(|err| {
            HarnessError::Config(format!("{}: {}", path.display(), err))
        })
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> HarnessResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = non_empty(lookup(AUTORUN_ENV_HOST)) {
            self.service.host = host;
        }
        if let Some(port) = parse_positive(AUTORUN_ENV_PORT, lookup(AUTORUN_ENV_PORT))? {
            self.service.port = u16::try_from(port).map_err(|_| {
                HarnessError::Config(format!("{} out of range (got: {})", AUTORUN_ENV_PORT, port))
            })?;
        }
        if let Some(python) = non_empty(lookup(AUTORUN_ENV_PYTHON)) {
            self.runtime.python = python;
        }
        if let Some(ms) = parse_positive(
            AUTORUN_ENV_HEALTH_TIMEOUT_MS,
            lookup(AUTORUN_ENV_HEALTH_TIMEOUT_MS),
        )? {
            self.timeouts.health_timeout_ms = ms;
        }
        if let Some(ms) = parse_positive(
            AUTORUN_ENV_REQUEST_TIMEOUT_MS,
            lookup(AUTORUN_ENV_REQUEST_TIMEOUT_MS),
        )? {
            self.timeouts.request_timeout_ms = ms;
        }
        if let Some(ms) = parse_positive(
            AUTORUN_ENV_SHUTDOWN_GRACE_MS,
            lookup(AUTORUN_ENV_SHUTDOWN_GRACE_MS),
        )? {
            self.timeouts.shutdown_grace_ms = ms;
        }
        Ok(())
    }

    pub fn validate(&self) -> HarnessResult<()> {
        let required = [
            ("layout.archive_extension", &self.layout.archive_extension),
            ("layout.entry_point", &self.layout.entry_point),
            ("layout.manifest", &self.layout.manifest),
            ("service.host", &self.service.host),
            ("service.expected_service", &self.service.expected_service),
            ("service.request_field", &self.service.request_field),
            ("service.response_field", &self.service.response_field),
            ("service.process_log", &self.service.process_log),
            ("runtime.python", &self.runtime.python),
            ("runtime.env_dir_name", &self.runtime.env_dir_name),
            ("report.filename", &self.report.filename),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(HarnessError::Config(format!("{} must not be empty", name)));
            }
        }
        if self.service.port == 0 {
            return Err(HarnessError::Config("service.port must be > 0".to_string()));
        }
        if self.service.output_dirs.is_empty() {
            return Err(HarnessError::Config(
                "service.output_dirs must name at least one directory".to_string(),
            ));
        }
        let t = &self.timeouts;
        let timeouts = [
            ("timeouts.port_probe_ms", t.port_probe_ms),
            ("timeouts.health_probe_ms", t.health_probe_ms),
            ("timeouts.health_timeout_ms", t.health_timeout_ms),
            ("timeouts.health_interval_ms", t.health_interval_ms),
            ("timeouts.request_timeout_ms", t.request_timeout_ms),
            ("timeouts.artifact_poll_ms", t.artifact_poll_ms),
            ("timeouts.shutdown_grace_ms", t.shutdown_grace_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(HarnessError::Config(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_positive(name: &str, raw: Option<String>) -> HarnessResult<Option<u64>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = trimmed.parse::<u64>().map_err(|_| {
        HarnessError::Config(format!(
            "{} must be a positive integer when set (got: {})",
            name, raw
        ))
    })?;
    if parsed == 0 {
        return Err(HarnessError::Config(format!("{} must be > 0 when set", name)));
    }
    Ok(Some(parsed))
}

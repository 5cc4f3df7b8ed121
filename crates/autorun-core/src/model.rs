use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const AUTOMATION_REPORT_SCHEMA_V1: &str = "automation_report_v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedProject {
    pub extract_root: PathBuf,
    /// Where the payload actually starts once a single wrapping folder has
    /// been stepped into.
    pub project_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLocation {
    pub service_dir: PathBuf,
    pub entry_point: PathBuf,
    pub manifest: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: Option<String>,
    pub service: String,
    pub session_id: String,
    pub total_conversations: u64,
    pub raw: Value,
}

impl HealthSnapshot {
    /// Reads the liveness payload leniently: the session id may be a string
    /// or a number, and a missing count reads as zero.
    pub fn from_value(raw: Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let service = obj.get("service")?.as_str()?.to_string();
        let session_id = match obj.get("session_id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let total_conversations = obj
            .get("total_conversations")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            status,
            service,
            session_id,
            total_conversations,
            raw,
        })
    }

    pub fn identifies_as(&self, expected_service: &str) -> bool {
        self.service.contains(expected_service)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed { output: String },
    Failed { reason: String },
}

/// Session identity as reported by the liveness endpoint right after a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCheck {
    pub session_id: String,
    pub total_conversations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub index: usize,
    pub input: String,
    #[serde(flatten)]
    pub outcome: TurnOutcome,
    /// `None` when the post-turn health probe failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_after: Option<SessionCheck>,
}

impl InteractionRecord {
    pub fn output(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Completed { output } => Some(output),
            TurnOutcome::Failed { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Completed { .. })
    }
}

/// One persisted exchange. Either side may be null in the service's file;
/// fields the harness does not know about are carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub assistant: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Turn {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            assistant: Some(assistant.into()),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionArtifact {
    pub session_id: String,
    #[serde(default)]
    pub conversations: Vec<Turn>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionArtifact {
    pub fn empty(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            conversations: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactStatus {
    Loaded { path: PathBuf },
    Unavailable { expected_path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub inputs_sent: usize,
    pub turns_succeeded: usize,
    pub turns_failed: usize,
    pub artifact_turns: usize,
    pub health_turns_before: u64,
    pub health_turns_after: Option<u64>,
    pub session_id_consistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPaths {
    pub extract_root: PathBuf,
    pub project_root: PathBuf,
    pub service_dir: PathBuf,
    pub entry_point: PathBuf,
    pub manifest: PathBuf,
    pub runtime_env: PathBuf,
    pub process_log: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub endpoint: String,
    pub reused: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationReport {
    pub schema_version: String,
    pub generated_at: String,
    pub archive: ArchiveInfo,
    pub session_id: String,
    pub paths: ReportPaths,
    pub service: ServiceInfo,
    pub health_before: HealthSnapshot,
    pub health_after: Option<HealthSnapshot>,
    pub interactions: Vec<InteractionRecord>,
    pub session_artifact: SessionArtifact,
    pub artifact_status: ArtifactStatus,
    pub reconciliation: Reconciliation,
}

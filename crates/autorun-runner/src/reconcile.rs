use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use autorun_core::config::{ServiceConventions, TimeoutSettings};
use autorun_core::model::{
    ArtifactStatus, AutomationReport, HealthSnapshot, InteractionRecord, Reconciliation,
    SessionArtifact,
};
use autorun_core::{atomic_write_json_pretty, CancelFlag, HarnessError, HarnessResult};
use tracing::{debug, info, warn};

use crate::pause;

/// Every place the service may have persisted the session, in preference
/// order.
pub fn artifact_candidates(
    service_dir: &Path,
    session_id: &str,
    service: &ServiceConventions,
) -> Vec<PathBuf> {
    let file_name = service.session_file_name(session_id);
    service
        .output_dirs
        .iter()
        .map(|dir| service_dir.join(dir).join(&file_name))
        .collect()
}

fn read_artifact(path: &Path) -> Result<SessionArtifact, String> {
    let bytes = fs::read(path).map_err(|err| format!("read failed: {}", err))?;
    serde_json::from_slice(&bytes).map_err(|err| format!("invalid session JSON: {}", err))
}

/// Polls the candidate locations until one holds a parseable artifact or the
/// wait runs out. An unavailable artifact is not an error here: the caller
/// gets an empty placeholder plus the reason.
pub fn await_artifact(
    service_dir: &Path,
    session_id: &str,
    service: &ServiceConventions,
    timeouts: &TimeoutSettings,
    cancel: &CancelFlag,
) -> HarnessResult<(SessionArtifact, ArtifactStatus)> {
    let candidates = artifact_candidates(service_dir, session_id, service);
    let deadline = Instant::now() + timeouts.artifact_wait();
    let mut failure: Option<(PathBuf, String)> = None;

    loop {
        cancel.check("artifact wait")?;
        for path in &candidates {
            if !path.is_file() {
                continue;
            }
            match read_artifact(path) {
                Ok(artifact) => {
                    info!(
                        path = %path.display(),
                        turns = artifact.conversations.len(),
                        "session artifact loaded"
                    );
                    return Ok((artifact, ArtifactStatus::Loaded { path: path.clone() }));
                }
                Err(reason) => {
                    debug!(path = %path.display(), %reason, "session artifact not readable yet");
                    failure = Some((path.clone(), reason));
                }
            }
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        pause(timeouts.artifact_poll().min(deadline - now), cancel)?;
    }

    let (expected_path, reason) = failure.unwrap_or_else(|| {
        let expected = candidates
            .first()
            .cloned()
            .unwrap_or_else(|| service_dir.join(service.session_file_name(session_id)));
        (
            expected,
            format!(
                "not found after {}ms in {:?}",
                timeouts.artifact_wait_ms, service.output_dirs
            ),
        )
    });
    let err = HarnessError::ArtifactUnavailable {
        path: expected_path.clone(),
        reason: reason.clone(),
    };
    warn!(code = err.code(), "{}", err);
    Ok((
        SessionArtifact::empty(session_id),
        ArtifactStatus::Unavailable {
            expected_path,
            reason,
        },
    ))
}

/// Side-by-side counts. Disagreements are reported, never repaired.
pub fn reconcile(
    health_before: &HealthSnapshot,
    health_after: Option<&HealthSnapshot>,
    interactions: &[InteractionRecord],
    artifact: &SessionArtifact,
    artifact_status: &ArtifactStatus,
) -> Reconciliation {
    let turns_succeeded = interactions.iter().filter(|r| r.is_completed()).count();
    let session_id = &health_before.session_id;
    let after_consistent = health_after.map_or(true, |h| &h.session_id == session_id);
    let turns_consistent = interactions
        .iter()
        .filter_map(|r| r.session_after.as_ref())
        .all(|check| &check.session_id == session_id);
    let artifact_consistent = match artifact_status {
        ArtifactStatus::Loaded { .. } => &artifact.session_id == session_id,
        ArtifactStatus::Unavailable { .. } => true,
    };
    let reconciliation = Reconciliation {
        inputs_sent: interactions.len(),
        turns_succeeded,
        turns_failed: interactions.len() - turns_succeeded,
        artifact_turns: artifact.conversations.len(),
        health_turns_before: health_before.total_conversations,
        health_turns_after: health_after.map(|h| h.total_conversations),
        session_id_consistent: after_consistent && turns_consistent && artifact_consistent,
    };
    if !reconciliation.session_id_consistent {
        warn!(%session_id, "session id changed during the run");
    }
    if matches!(artifact_status, ArtifactStatus::Loaded { .. })
        && reconciliation.artifact_turns
            != health_before.total_conversations as usize + turns_succeeded
    {
        warn!(
            artifact_turns = reconciliation.artifact_turns,
            turns_succeeded,
            health_turns_before = health_before.total_conversations,
            "artifact turn count disagrees with observed turns"
        );
    }
    reconciliation
}

pub fn write_report(
    project_root: &Path,
    file_name: &str,
    report: &AutomationReport,
) -> HarnessResult<PathBuf> {
    let path = project_root.join(file_name);
    atomic_write_json_pretty(&path, report)?;
    info!(path = %path.display(), "automation report written");
    Ok(path)
}

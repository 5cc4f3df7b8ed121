use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use autorun_archive::{
    default_extract_dir, extract_archive, guard_extract_root, locate_service, resolve_archive,
};
use autorun_core::model::{
    ArchiveInfo, AutomationReport, ExtractedProject, ReportPaths, ServiceInfo, ServiceLocation,
    AUTOMATION_REPORT_SCHEMA_V1,
};
use autorun_core::{sha256_file, tail_lines, CancelFlag, HarnessConfig, HarnessResult};
use serde::Serialize;
use tracing::{info, warn};

pub mod client;
pub mod driver;
pub mod lifecycle;
pub mod provision;
pub mod reconcile;

#[cfg(test)]
mod test_support;

pub use client::ServiceClient;
pub use lifecycle::{LifecycleState, ServiceHandle, ShutdownOutcome};
pub use provision::RuntimeEnvironment;

const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Sleeps for `duration`, waking early with `Interrupted` when cancelled.
pub(crate) fn pause(duration: Duration, cancel: &CancelFlag) -> HarnessResult<()> {
    let deadline = Instant::now() + duration;
    loop {
        cancel.check("wait")?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(PAUSE_SLICE.min(deadline - now));
    }
}

/// A resolved, extracted and located submission. Nothing has been installed
/// or started yet.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub archive: ArchiveInfo,
    pub extracted: ExtractedProject,
    pub location: ServiceLocation,
}

pub fn prepare_submission(
    config: &HarnessConfig,
    work_dir: &Path,
    archive: Option<&Path>,
    extract_dir: Option<&Path>,
    cancel: &CancelFlag,
) -> HarnessResult<Submission> {
    let archive_path = resolve_archive(work_dir, archive, &config.layout)?;
    let sha256 = sha256_file(&archive_path)?;
    info!(archive = %archive_path.display(), %sha256, "submission archive selected");

    cancel.check("extraction")?;
    let extract_root = extract_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_extract_dir(work_dir, &archive_path));
    guard_extract_root(&archive_path, &extract_root, &[work_dir])?;
    let extracted = extract_archive(&archive_path, &extract_root)?;

    cancel.check("layout search")?;
    let location = locate_service(&extracted.project_root, &config.layout)?;
    info!(
        service_dir = %location.service_dir.display(),
        entry_point = %location.entry_point.display(),
        "service located"
    );

    Ok(Submission {
        archive: ArchiveInfo {
            path: archive_path,
            sha256,
        },
        extracted,
        location,
    })
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub work_dir: PathBuf,
    pub archive: Option<PathBuf>,
    pub extract_dir: Option<PathBuf>,
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub report_path: PathBuf,
    pub report: AutomationReport,
    /// `None` when shutdown itself failed; the failure is only logged.
    pub shutdown: Option<ShutdownOutcome>,
    pub process_log_tail: Option<String>,
}

/// One full run. The report is written before the service is stopped, so a
/// failed shutdown never loses results. Any early return drops the service
/// handle, which stops an owned process.
pub fn run_submission(
    config: &HarnessConfig,
    request: &RunRequest,
    cancel: &CancelFlag,
) -> HarnessResult<RunOutput> {
    let submission = prepare_submission(
        config,
        &request.work_dir,
        request.archive.as_deref(),
        request.extract_dir.as_deref(),
        cancel,
    )?;
    let location = &submission.location;

    cancel.check("provisioning")?;
    let env = provision::provision(location, &config.runtime, cancel)?;

    let client = ServiceClient::new(&config.service, &config.timeouts)?;
    let mut handle = ServiceHandle::new(client.base_url(), config.timeouts.shutdown_grace());
    handle.mark_provisioned();
    let health_before =
        lifecycle::attach_or_launch(&mut handle, &client, &env, location, config, cancel)?;
    let session_id = health_before.session_id.clone();
    info!(%session_id, reused = !handle.owned(), "session established");

    let interactions = driver::run_batch(&client, &request.inputs, cancel)?;
    pause(config.timeouts.settle(), cancel)?;

    let (session_artifact, artifact_status) = reconcile::await_artifact(
        &location.service_dir,
        &session_id,
        &config.service,
        &config.timeouts,
        cancel,
    )?;
    let health_after = match client.probe_health() {
        Ok(health) => Some(health),
        Err(err) => {
            warn!(error = %err, "final health probe failed");
            None
        }
    };
    let reconciliation = reconcile::reconcile(
        &health_before,
        health_after.as_ref(),
        &interactions,
        &session_artifact,
        &artifact_status,
    );

    let report = AutomationReport {
        schema_version: AUTOMATION_REPORT_SCHEMA_V1.to_string(),
        generated_at: chrono::Utc::now().to_rfc3339(),
        archive: submission.archive.clone(),
        session_id,
        paths: ReportPaths {
            extract_root: submission.extracted.extract_root.clone(),
            project_root: submission.extracted.project_root.clone(),
            service_dir: location.service_dir.clone(),
            entry_point: location.entry_point.clone(),
            manifest: location.manifest.clone(),
            runtime_env: env.root.clone(),
            process_log: handle.log_path().map(Path::to_path_buf),
        },
        service: ServiceInfo {
            endpoint: handle.endpoint().to_string(),
            reused: !handle.owned(),
            pid: handle.pid(),
        },
        health_before,
        health_after,
        interactions,
        session_artifact,
        artifact_status,
        reconciliation,
    };
    let report_path = reconcile::write_report(
        &submission.extracted.project_root,
        &config.report.filename,
        &report,
    )?;

    let shutdown = match handle.shutdown() {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            warn!(code = err.code(), "{}", err);
            None
        }
    };
    let process_log_tail = handle
        .log_path()
        .map(|path| tail_lines(path, config.report.log_tail_lines));

    Ok(RunOutput {
        report_path,
        report,
        shutdown,
        process_log_tail,
    })
}

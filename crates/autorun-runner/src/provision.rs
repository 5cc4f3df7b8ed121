use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use autorun_core::config::RuntimeSettings;
use autorun_core::model::ServiceLocation;
use autorun_core::{remove_if_exists, tail_text, CancelFlag, HarnessError, HarnessResult};
use serde::Serialize;
use tracing::{info, warn};

const MAX_INSTALLER_OUTPUT_LINES: usize = 40;

/// An isolated interpreter plus installer, owned by a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeEnvironment {
    pub root: PathBuf,
    pub interpreter: PathBuf,
    pub installer: PathBuf,
}

impl RuntimeEnvironment {
    pub fn at(root: &Path) -> Self {
        #[cfg(windows)]
        let (interpreter, installer) = (
            root.join("Scripts").join("python.exe"),
            root.join("Scripts").join("pip.exe"),
        );
        #[cfg(not(windows))]
        let (interpreter, installer) = (root.join("bin").join("python"), root.join("bin").join("pip"));
        Self {
            root: root.to_path_buf(),
            interpreter,
            installer,
        }
    }
}

struct CapturedRun {
    success: bool,
    status: String,
    output: String,
}

fn run_captured(mut cmd: Command) -> std::io::Result<CapturedRun> {
    cmd.stdin(Stdio::null());
    let output = cmd.output()?;
    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    Ok(CapturedRun {
        success: output.status.success(),
        status: output
            .status
            .code()
            .map(|c| format!("exit {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string()),
        output: combined,
    })
}

/// Stale environment removal, fresh environment, best-effort baseline
/// upgrade, then the manifest install. Nothing is retried here.
pub fn provision(
    location: &ServiceLocation,
    runtime: &RuntimeSettings,
    cancel: &CancelFlag,
) -> HarnessResult<RuntimeEnvironment> {
    let env = RuntimeEnvironment::at(&location.service_dir.join(&runtime.env_dir_name));

    remove_if_exists(&env.root)?;

    cancel.check("environment creation")?;
    info!(path = %env.root.display(), python = %runtime.python, "creating runtime environment");
    let mut create = Command::new(&runtime.python);
    create.arg("-m").arg("venv").arg(&env.root);
    let created = run_captured(create).map_err(|err| HarnessError::EnvironmentCreateFailed {
        path: env.root.clone(),
        detail: format!("could not run {}: {}", runtime.python, err),
    })?;
    if !created.success || !env.installer.exists() {
        return Err(HarnessError::EnvironmentCreateFailed {
            path: env.root.clone(),
            detail: format!(
                "{} ({})",
                created.status,
                tail_text(&created.output, MAX_INSTALLER_OUTPUT_LINES)
            ),
        });
    }

    cancel.check("baseline tooling upgrade")?;
    if !runtime.baseline_packages.is_empty() {
        let mut upgrade = Command::new(&env.installer);
        upgrade
            .arg("install")
            .arg("--upgrade")
            .args(&runtime.baseline_packages);
        match run_captured(upgrade) {
            Ok(run) if run.success => {
                info!(packages = ?runtime.baseline_packages, "baseline tooling upgraded")
            }
            Ok(run) => warn!(
                status = %run.status,
                output = %tail_text(&run.output, 5),
                "could not upgrade baseline tooling; proceeding"
            ),
            Err(err) => warn!(error = %err, "could not upgrade baseline tooling; proceeding"),
        }
    }

    cancel.check("dependency install")?;
    info!(manifest = %location.manifest.display(), "installing dependencies");
    let mut install = Command::new(&env.installer);
    install.arg("install").arg("-r").arg(&location.manifest);
    let installed = run_captured(install).map_err(|err| HarnessError::DependencyInstallFailed {
        manifest: location.manifest.clone(),
        status: "not started".to_string(),
        output: err.to_string(),
    })?;
    if !installed.success {
        return Err(HarnessError::DependencyInstallFailed {
            manifest: location.manifest.clone(),
            status: installed.status,
            output: tail_text(&installed.output, MAX_INSTALLER_OUTPUT_LINES),
        });
    }
    info!("dependencies installed");
    Ok(env)
}

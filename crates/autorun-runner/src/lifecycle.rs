use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use autorun_core::config::HarnessConfig;
use autorun_core::model::{HealthSnapshot, ServiceLocation};
use autorun_core::{tail_lines, CancelFlag, HarnessError, HarnessResult, IoResultExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{port_is_open, ServiceClient};
use crate::provision::RuntimeEnvironment;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Provisioned,
    Launching,
    AwaitingHealth,
    Healthy,
    Draining,
    Terminated,
    Failed,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Terminated, _) => false,
            (Failed, Draining | Terminated) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (Idle, Provisioned)
            | (Provisioned, Launching | Healthy)
            | (Launching, AwaitingHealth)
            | (AwaitingHealth, Healthy | Draining)
            | (Healthy, Draining | Terminated)
            | (Draining, Terminated) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// Attached to an instance the harness did not start; left running.
    NotOwned,
    AlreadyExited,
    Graceful,
    Forced,
}

/// The candidate service as a run-scoped resource. Whether shutdown acts is
/// decided by `owned`, never by whether a child handle happens to exist, and
/// an owned process still alive when the handle is dropped is shut down.
#[derive(Debug)]
pub struct ServiceHandle {
    state: LifecycleState,
    endpoint: String,
    owned: bool,
    process: Option<Child>,
    pid: Option<u32>,
    log_path: Option<PathBuf>,
    grace: Duration,
}

impl ServiceHandle {
    pub fn new(endpoint: impl Into<String>, grace: Duration) -> Self {
        Self {
            state: LifecycleState::Idle,
            endpoint: endpoint.into(),
            owned: false,
            process: None,
            pid: None,
            log_path: None,
            grace,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn owned(&self) -> bool {
        self.owned
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn mark_provisioned(&mut self) {
        self.transition(LifecycleState::Provisioned);
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "unexpected lifecycle transition");
        }
        debug!(from = ?self.state, to = ?next, "service lifecycle");
        self.state = next;
    }

    fn exit_status(&mut self) -> Option<String> {
        let child = self.process.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            _ => None,
        }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL. A no-op for an
    /// instance the harness merely attached to.
    pub fn shutdown(&mut self) -> HarnessResult<ShutdownOutcome> {
        if !self.owned {
            self.transition(LifecycleState::Terminated);
            return Ok(ShutdownOutcome::NotOwned);
        }
        let Some(mut child) = self.process.take() else {
            self.transition(LifecycleState::Terminated);
            return Ok(ShutdownOutcome::AlreadyExited);
        };
        self.transition(LifecycleState::Draining);
        let pid = child.id();

        if let Ok(Some(status)) = child.try_wait() {
            info!(pid, %status, "service process had already exited");
            self.transition(LifecycleState::Terminated);
            return Ok(ShutdownOutcome::AlreadyExited);
        }

        info!(pid, grace_ms = self.grace.as_millis() as u64, "terminating service process");
        match request_termination(&mut child) {
            Ok(()) => {
                let deadline = Instant::now() + self.grace;
                while Instant::now() < deadline {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            info!(pid, %status, "service process exited");
                            self.transition(LifecycleState::Terminated);
                            return Ok(ShutdownOutcome::Graceful);
                        }
                        Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                        Err(err) => {
                            warn!(pid, error = %err, "failed polling service process");
                            break;
                        }
                    }
                }
                warn!(pid, "service process ignored termination request; killing");
            }
            Err(err) => warn!(pid, error = %err, "termination request failed; killing"),
        }

        let killed = child.kill().and_then(|_| child.wait());
        self.transition(LifecycleState::Terminated);
        match killed {
            Ok(status) => {
                info!(pid, %status, "service process killed");
                Ok(ShutdownOutcome::Forced)
            }
            Err(err) => Err(HarnessError::ShutdownFailed {
                pid,
                detail: err.to_string(),
            }),
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if self.owned && self.process.is_some() {
            if let Err(err) = self.shutdown() {
                warn!(error = %err, "cleanup shutdown failed");
            }
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

/// Reuses a compatible instance already bound to the port, otherwise starts
/// the entry point and waits for it to report healthy.
pub fn attach_or_launch(
    handle: &mut ServiceHandle,
    client: &ServiceClient,
    env: &RuntimeEnvironment,
    location: &ServiceLocation,
    config: &HarnessConfig,
    cancel: &CancelFlag,
) -> HarnessResult<HealthSnapshot> {
    let service = &config.service;
    if port_is_open(&service.host, service.port, config.timeouts.port_probe()) {
        match client.probe_health() {
            Ok(health) if health.identifies_as(&service.expected_service) => {
                info!(
                    port = service.port,
                    session_id = %health.session_id,
                    "reusing running service"
                );
                handle.owned = false;
                handle.transition(LifecycleState::Healthy);
                return Ok(health);
            }
            Ok(health) => warn!(
                port = service.port,
                found = %health.service,
                "port is in use by another service; launching anyway"
            ),
            Err(err) => warn!(
                port = service.port,
                error = %err,
                "port is open but health check failed; launching anyway"
            ),
        }
    }

    cancel.check("launch")?;
    launch(handle, env, location, &service.process_log)?;
    wait_for_health(handle, client, config, cancel)
}

pub fn launch(
    handle: &mut ServiceHandle,
    env: &RuntimeEnvironment,
    location: &ServiceLocation,
    process_log: &str,
) -> HarnessResult<()> {
    handle.transition(LifecycleState::Launching);
    let log_path = location.service_dir.join(process_log);
    let spawned = (|| -> HarnessResult<Child> {
        let log = fs::File::create(&log_path)
            .io_context(|| format!("failed creating {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .io_context(|| format!("failed duplicating {}", log_path.display()))?;
        Command::new(&env.interpreter)
            .arg(&location.entry_point)
            .current_dir(&location.service_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|err| HarnessError::LaunchFailed {
                entry_point: location.entry_point.clone(),
                detail: err.to_string(),
            })
    })();

    let child = match spawned {
        Ok(child) => child,
        Err(err) => {
            handle.transition(LifecycleState::Failed);
            return Err(err);
        }
    };
    info!(
        pid = child.id(),
        entry_point = %location.entry_point.display(),
        log = %log_path.display(),
        "service process started"
    );
    handle.pid = Some(child.id());
    handle.process = Some(child);
    handle.owned = true;
    handle.log_path = Some(log_path);
    handle.transition(LifecycleState::AwaitingHealth);
    Ok(())
}

/// Polls the liveness endpoint until it identifies as the expected service.
/// Gives up at the deadline, or as soon as an owned process exits.
pub fn wait_for_health(
    handle: &mut ServiceHandle,
    client: &ServiceClient,
    config: &HarnessConfig,
    cancel: &CancelFlag,
) -> HarnessResult<HealthSnapshot> {
    let timeout = config.timeouts.health_timeout();
    let interval = config.timeouts.health_interval();
    let expected = &config.service.expected_service;
    let started = Instant::now();
    let deadline = started + timeout;
    let mut last_error = "no probe completed".to_string();

    loop {
        cancel.check("health polling")?;
        match client.probe_health() {
            Ok(health) if health.identifies_as(expected) => {
                info!(
                    session_id = %health.session_id,
                    total_conversations = health.total_conversations,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "service healthy"
                );
                handle.transition(LifecycleState::Healthy);
                return Ok(health);
            }
            Ok(health) => {
                last_error = format!(
                    "service identified as '{}', expected '{}'",
                    health.service, expected
                );
            }
            Err(err) => last_error = err,
        }
        if let Some(status) = handle.exit_status() {
            last_error = format!("process exited ({}) before becoming healthy", status);
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(interval.min(deadline - now));
    }

    let log_tail = handle
        .log_path()
        .map(|p| tail_lines(p, config.report.log_tail_lines))
        .unwrap_or_default();
    warn!(
        detail = %last_error,
        "service did not become healthy; process log tail:\n{}",
        log_tail
    );
    handle.transition(LifecycleState::Failed);
    Err(HarnessError::HealthCheckTimeout {
        url: client.health_url().to_string(),
        waited_ms: started.elapsed().as_millis() as u64,
        detail: last_error,
        log_tail,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{fast_config, free_port, FakeService, FakeServiceOptions};

    struct Fixture {
        _dir: tempfile::TempDir,
        env: RuntimeEnvironment,
        location: ServiceLocation,
    }

    /// A service dir whose entry point is a shell script, run by a venv
    /// `python` that simply execs `/bin/sh`.
    fn fixture(app_body: &str) -> Fixture {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let service_dir = dir.path().join("backend-python");
        fs::create_dir_all(&service_dir).expect("mkdir");
        fs::write(service_dir.join("app.py"), app_body).expect("app");
        fs::write(service_dir.join("requirements.txt"), "flask\n").expect("manifest");
        let env = RuntimeEnvironment::at(&service_dir.join(".venv_autorun"));
        fs::create_dir_all(env.interpreter.parent().unwrap()).expect("bin dir");
        fs::write(&env.interpreter, "#!/bin/sh\nexec /bin/sh \"$@\"\n").expect("python");
        fs::set_permissions(&env.interpreter, fs::Permissions::from_mode(0o755)).expect("chmod");
        Fixture {
            location: ServiceLocation {
                entry_point: service_dir.join("app.py"),
                manifest: service_dir.join("requirements.txt"),
                service_dir,
            },
            env,
            _dir: dir,
        }
    }

    fn process_alive(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[test]
    fn transition_table_allows_failed_from_every_live_state() {
        use LifecycleState::*;
        for state in [Idle, Provisioned, Launching, AwaitingHealth, Healthy, Draining] {
            assert!(state.can_transition_to(Failed), "{:?} -> Failed", state);
        }
        assert!(!Terminated.can_transition_to(Failed));
        assert!(Provisioned.can_transition_to(Healthy), "reuse skips launch");
        assert!(!Idle.can_transition_to(Healthy));
        assert!(!Healthy.can_transition_to(Launching));
    }

    #[test]
    fn compatible_running_service_is_reused_and_left_running() {
        let fake = FakeService::start(FakeServiceOptions::default());
        let config = fast_config(fake.port());
        let client = ServiceClient::new(&config.service, &config.timeouts).expect("client");
        let fx = fixture("exit 99\n");
        let mut handle = ServiceHandle::new(client.base_url(), config.timeouts.shutdown_grace());
        handle.mark_provisioned();

        let health = attach_or_launch(
            &mut handle,
            &client,
            &fx.env,
            &fx.location,
            &config,
            &CancelFlag::new(),
        )
        .expect("reuse");

        assert_eq!(health.session_id, "20251104_215514");
        assert!(!handle.owned());
        assert_eq!(handle.pid(), None);
        assert_eq!(handle.state(), LifecycleState::Healthy);
        assert!(!fx.location.service_dir.join("server.log").exists());

        assert_eq!(handle.shutdown().expect("shutdown"), ShutdownOutcome::NotOwned);
        drop(handle);
        assert!(client.probe_health().is_ok(), "reused service must survive");
        fake.stop();
    }

    #[test]
    fn launched_service_becomes_healthy_then_terminates_gracefully() {
        let port = free_port();
        let config = fast_config(port);
        let client = ServiceClient::new(&config.service, &config.timeouts).expect("client");
        let fx = fixture("echo booting\nexec sleep 30\n");
        // The listener comes up shortly after launch, as a real server would.
        let starter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            FakeService::start(FakeServiceOptions {
                port,
                ..FakeServiceOptions::default()
            })
        });
        let mut handle = ServiceHandle::new(client.base_url(), config.timeouts.shutdown_grace());
        handle.mark_provisioned();

        let health = attach_or_launch(
            &mut handle,
            &client,
            &fx.env,
            &fx.location,
            &config,
            &CancelFlag::new(),
        )
        .expect("healthy");
        let fake = starter.join().expect("fake service thread");

        assert!(handle.owned());
        let pid = handle.pid().expect("pid");
        assert_eq!(handle.state(), LifecycleState::Healthy);
        assert_eq!(health.total_conversations, 0);

        assert_eq!(handle.shutdown().expect("shutdown"), ShutdownOutcome::Graceful);
        assert_eq!(handle.state(), LifecycleState::Terminated);
        assert!(!process_alive(pid));
        let log = fs::read_to_string(fx.location.service_dir.join("server.log")).expect("log");
        assert!(log.contains("booting"), "{}", log);
        fake.stop();
    }

    #[test]
    fn process_ignoring_sigterm_is_killed_after_grace() {
        let mut config = fast_config(free_port());
        config.timeouts.shutdown_grace_ms = 200;
        let fx = fixture("trap '' TERM\nsleep 5\n");
        let mut handle = ServiceHandle::new("http://127.0.0.1", config.timeouts.shutdown_grace());
        handle.mark_provisioned();
        launch(&mut handle, &fx.env, &fx.location, "server.log").expect("launch");
        // give the shell time to install its trap
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        assert_eq!(handle.shutdown().expect("shutdown"), ShutdownOutcome::Forced);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(handle.state(), LifecycleState::Terminated);
    }

    #[test]
    fn early_exit_fails_health_with_log_tail() {
        let config = fast_config(free_port());
        let client = ServiceClient::new(&config.service, &config.timeouts).expect("client");
        let fx = fixture("echo 'Traceback: ModuleNotFoundError: flask'\nexit 3\n");
        let mut handle = ServiceHandle::new(client.base_url(), config.timeouts.shutdown_grace());
        handle.mark_provisioned();

        let err = attach_or_launch(
            &mut handle,
            &client,
            &fx.env,
            &fx.location,
            &config,
            &CancelFlag::new(),
        )
        .expect_err("never healthy");

        match err {
            HarnessError::HealthCheckTimeout {
                log_tail, detail, waited_ms, ..
            } => {
                assert!(log_tail.contains("ModuleNotFoundError"), "{}", log_tail);
                assert!(detail.contains("exited"), "{}", detail);
                assert!(waited_ms < config.timeouts.health_timeout_ms);
            }
            other => panic!("expected HealthCheckTimeout, got {:?}", other),
        }
        assert_eq!(handle.state(), LifecycleState::Failed);
    }

    #[test]
    fn health_times_out_for_silent_process() {
        let mut config = fast_config(free_port());
        config.timeouts.health_timeout_ms = 400;
        let client = ServiceClient::new(&config.service, &config.timeouts).expect("client");
        let fx = fixture("exec sleep 30\n");
        let mut handle = ServiceHandle::new(client.base_url(), config.timeouts.shutdown_grace());
        handle.mark_provisioned();

        let err = attach_or_launch(
            &mut handle,
            &client,
            &fx.env,
            &fx.location,
            &config,
            &CancelFlag::new(),
        )
        .expect_err("never healthy");
        assert!(matches!(err, HarnessError::HealthCheckTimeout { waited_ms, .. } if waited_ms >= 400));

        let pid = handle.pid().expect("pid");
        drop(handle);
        assert!(!process_alive(pid), "dropping the handle must stop the process");
    }
}

use std::fs;
use std::io::Read;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use autorun_core::HarnessConfig;
use serde_json::{json, Value};
use tiny_http::{Header, Method, Response, Server};

pub(crate) const STOCK_SERVICE_NAME: &str = "Python Flask Backend";

pub(crate) fn echo_of(input: &str) -> String {
    format!("I listened to you: {}", input)
}

pub(crate) fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Defaults with every wait shortened so failing paths finish quickly.
pub(crate) fn fast_config(port: u16) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.service.port = port;
    config.timeouts.port_probe_ms = 200;
    config.timeouts.health_probe_ms = 500;
    config.timeouts.health_timeout_ms = 3_000;
    config.timeouts.health_interval_ms = 50;
    config.timeouts.request_timeout_ms = 2_000;
    config.timeouts.settle_ms = 10;
    config.timeouts.artifact_wait_ms = 500;
    config.timeouts.artifact_poll_ms = 25;
    config.timeouts.shutdown_grace_ms = 2_000;
    config
}

#[derive(Debug, Clone)]
pub(crate) struct FakeServiceOptions {
    pub port: u16,
    pub service_name: String,
    pub session_id: String,
    /// Where `session_<id>.json` is persisted after each turn.
    pub output_dir: Option<PathBuf>,
    /// Inputs answered with HTTP 500 instead of an echo.
    pub fail_inputs: Vec<String>,
}

impl Default for FakeServiceOptions {
    fn default() -> Self {
        Self {
            port: 0,
            service_name: STOCK_SERVICE_NAME.to_string(),
            session_id: "20251104_215514".to_string(),
            output_dir: None,
            fail_inputs: Vec::new(),
        }
    }
}

#[derive(Default)]
struct FakeServiceState {
    conversations: Vec<Value>,
    chat_requests: usize,
}

pub(crate) struct FakeService {
    port: u16,
    server: Arc<Server>,
    state: Arc<Mutex<FakeServiceState>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FakeService {
    pub(crate) fn start(options: FakeServiceOptions) -> Self {
        let listener =
            TcpListener::bind(("127.0.0.1", options.port)).expect("bind fake service port");
        let port = listener.local_addr().expect("local addr").port();
        let server = Arc::new(Server::from_listener(listener, None).expect("fake service server"));
        let state = Arc::new(Mutex::new(FakeServiceState::default()));

        let server_clone = server.clone();
        let state_clone = state.clone();
        let thread = thread::spawn(move || {
            for mut request in server_clone.incoming_requests() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let (code, payload) = {
                    let mut guard = state_clone.lock().unwrap_or_else(|e| e.into_inner());
                    handle(&options, &mut guard, request.method(), request.url(), &body)
                };
                let header = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                    .expect("content type header");
                let response = Response::from_string(payload.to_string())
                    .with_status_code(code)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            port,
            server,
            state,
            thread: Some(thread),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn chat_requests(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .chat_requests
    }

    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FakeService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handle(
    options: &FakeServiceOptions,
    state: &mut FakeServiceState,
    method: &Method,
    url: &str,
    body: &str,
) -> (u16, Value) {
    match (method, url) {
        (Method::Get, "/health") => (
            200,
            json!({
                "status": "healthy",
                "service": options.service_name,
                "session_id": options.session_id,
                "total_conversations": state.conversations.len(),
            }),
        ),
        (Method::Post, "/chat") => {
            state.chat_requests += 1;
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v.get("user_message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            if message.is_empty() {
                return (400, json!({"error": "user_message is required"}));
            }
            if options.fail_inputs.contains(&message) {
                return (500, json!({"error": "simulated failure"}));
            }
            let reply = echo_of(&message);
            state
                .conversations
                .push(json!({"user": message, "assistant": reply}));
            if let Some(dir) = &options.output_dir {
                persist(dir, &options.session_id, &state.conversations);
            }
            (200, json!({"assistant_response": reply}))
        }
        _ => (404, json!({"error": "not found"})),
    }
}

fn persist(dir: &Path, session_id: &str, conversations: &[Value]) {
    let _ = fs::create_dir_all(dir);
    let doc = json!({"session_id": session_id, "conversations": conversations});
    let bytes = serde_json::to_vec_pretty(&doc).expect("serialize session");
    let _ = fs::write(dir.join(format!("session_{}.json", session_id)), bytes);
}

/// Writes a stand-in for the host interpreter. `-m venv DIR` lays down a
/// `bin/python` that runs its script with `/bin/sh`, and a `bin/pip` that
/// fails any `-r` install whose manifest mentions `FAIL_INSTALL`.
#[cfg(unix)]
pub(crate) fn write_fake_python(dir: &Path, baseline_upgrade_ok: bool) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let templates = dir.join("fake_python_templates");
    fs::create_dir_all(&templates).expect("templates dir");
    let upgrade = if baseline_upgrade_ok {
        "echo 'upgraded baseline tooling'; exit 0"
    } else {
        "echo 'upgrade refused: offline' >&2; exit 1"
    };
    let pip = format!(
        "#!/bin/sh\n\
         if [ \"$1\" = install ] && [ \"$2\" = --upgrade ]; then {upgrade}; fi\n\
         if [ \"$1\" = install ] && [ \"$2\" = -r ]; then\n\
           if grep -q FAIL_INSTALL \"$3\"; then\n\
             echo 'ERROR: No matching distribution found for FAIL_INSTALL' >&2\n\
             exit 1\n\
           fi\n\
           echo \"installed from $3\"\n\
           exit 0\n\
         fi\n\
         exit 2\n"
    );
    let venv_python = "#!/bin/sh\nexec /bin/sh \"$@\"\n";
    fs::write(templates.join("pip"), pip).expect("pip template");
    fs::write(templates.join("python"), venv_python).expect("python template");

    let interpreter = dir.join("fake-python3");
    let script = format!(
        "#!/bin/sh\n\
         if [ \"$1\" = -m ] && [ \"$2\" = venv ]; then\n\
           mkdir -p \"$3/bin\" || exit 1\n\
           cp '{t}/python' \"$3/bin/python\" && cp '{t}/pip' \"$3/bin/pip\" || exit 1\n\
           chmod +x \"$3/bin/python\" \"$3/bin/pip\"\n\
           exit 0\n\
         fi\n\
         echo \"unsupported invocation: $*\" >&2\n\
         exit 2\n",
        t = templates.display()
    );
    fs::write(&interpreter, script).expect("fake interpreter");
    fs::set_permissions(&interpreter, fs::Permissions::from_mode(0o755)).expect("chmod");
    interpreter
}

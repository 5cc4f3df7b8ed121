use anyhow::{Context, Result};
use autorun_core::model::{ArtifactStatus, TurnOutcome};
use autorun_core::{CancelFlag, HarnessConfig, HarnessError};
use autorun_runner::driver::{default_script, parse_script};
use autorun_runner::{prepare_submission, run_submission, RunOutput, RunRequest, Submission};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(
    name = "autorun",
    version,
    about = "Runs a submitted conversational service end to end and reports on one session"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Extract, provision, launch or reuse, run the script, and write the report")]
    Run {
        archive: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,
        #[arg(long)]
        extract_dir: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        inputs: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    #[command(about = "Resolve and extract the archive, then show where the service lives")]
    Locate {
        archive: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,
        #[arg(long)]
        extract_dir: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    #[command(about = "Print the interaction script a run would send")]
    Script {
        #[arg(long)]
        inputs: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        tracing::warn!("interrupt received; stopping after the current step");
        handler_flag.cancel();
    }) {
        tracing::warn!(error = %err, "could not install interrupt handler");
    }

    match run_command(cli.command, &cancel) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            let harness_err = err.downcast_ref::<HarnessError>();
            let interrupted = matches!(harness_err, Some(HarnessError::Interrupted { .. }));
            if json_mode {
                let code = harness_err.map_or("command_failed", HarnessError::code);
                emit_json(&json_error(code, format!("{:#}", err)));
                std::process::exit(if interrupted { EXIT_INTERRUPTED } else { 1 });
            }
            if interrupted {
                eprintln!("{}", err);
                std::process::exit(EXIT_INTERRUPTED);
            }
            Err(err)
        }
    }
}

/// Logs go to stderr so `--json` output on stdout stays machine-readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_command(command: Commands, cancel: &CancelFlag) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            archive,
            work_dir,
            extract_dir,
            config,
            inputs,
            json,
        } => {
            let config = HarnessConfig::load(config.as_deref())?;
            let inputs = load_inputs(inputs.as_deref())?;
            if inputs.is_empty() {
                tracing::warn!("interaction script is empty; only health and artifact will be checked");
            }
            let request = RunRequest {
                work_dir,
                archive,
                extract_dir,
                inputs,
            };
            let output = run_submission(&config, &request, cancel)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "report_path": output.report_path,
                    "shutdown": output.shutdown,
                    "report": output.report,
                })));
            }
            print_run_summary(&output);
            Ok(None)
        }
        Commands::Locate {
            archive,
            work_dir,
            extract_dir,
            config,
            json,
        } => {
            let config = HarnessConfig::load(config.as_deref())?;
            let submission = prepare_submission(
                &config,
                &work_dir,
                archive.as_deref(),
                extract_dir.as_deref(),
                cancel,
            )?;
            if json {
                return Ok(Some(json!({ "ok": true, "submission": submission })));
            }
            print_submission(&submission);
            Ok(None)
        }
        Commands::Script { inputs } => {
            for (idx, input) in load_inputs(inputs.as_deref())?.iter().enumerate() {
                println!("{}. {}", idx + 1, input);
            }
            Ok(None)
        }
    }
}

fn load_inputs(path: Option<&Path>) -> Result<Vec<String>> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading inputs file {}", path.display()))?;
            Ok(parse_script(&text))
        }
        None => Ok(default_script()),
    }
}

fn print_submission(submission: &Submission) {
    println!("archive: {}", submission.archive.path.display());
    println!("sha256: {}", submission.archive.sha256);
    println!("extract_root: {}", submission.extracted.extract_root.display());
    println!("project_root: {}", submission.extracted.project_root.display());
    println!("service_dir: {}", submission.location.service_dir.display());
    println!("entry_point: {}", submission.location.entry_point.display());
    println!("manifest: {}", submission.location.manifest.display());
}

fn print_run_summary(output: &RunOutput) {
    let report = &output.report;
    println!("session_id: {}", report.session_id);
    println!(
        "service: {} ({})",
        report.service.endpoint,
        if report.service.reused {
            "reused".to_string()
        } else {
            format!("launched, pid {}", report.service.pid.unwrap_or_default())
        }
    );
    println!();
    for record in &report.interactions {
        println!("[{}] > {}", record.index, record.input);
        match &record.outcome {
            TurnOutcome::Completed { output } => println!("    < {}", output),
            TurnOutcome::Failed { reason } => println!("    ! failed: {}", reason),
        }
    }
    println!();
    let summary = &report.reconciliation;
    println!(
        "turns: {} sent, {} succeeded, {} failed",
        summary.inputs_sent, summary.turns_succeeded, summary.turns_failed
    );
    match &report.artifact_status {
        ArtifactStatus::Loaded { path } => println!(
            "artifact: {} ({} turns)",
            path.display(),
            summary.artifact_turns
        ),
        ArtifactStatus::Unavailable {
            expected_path,
            reason,
        } => println!("artifact: unavailable at {} ({})", expected_path.display(), reason),
    }
    println!(
        "health turns: {} before, {} after",
        summary.health_turns_before,
        summary
            .health_turns_after
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    if !summary.session_id_consistent {
        println!("warning: session id changed during the run");
    }
    println!("report: {}", output.report_path.display());
    match output.shutdown {
        Some(outcome) => println!("shutdown: {:?}", outcome),
        None => println!("shutdown: failed (see log)"),
    }
    if let Some(tail) = output.process_log_tail.as_deref().filter(|t| !t.is_empty()) {
        println!();
        println!("--- process log tail ---");
        println!("{}", tail);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Locate { json, .. } => *json,
        Commands::Script { .. } => false,
    }
}

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub mod config;
pub mod error;
pub mod model;

pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult, IoResultExt};

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> HarnessResult<String> {
    let mut file =
        fs::File::open(path).io_context(|| format!("failed opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .io_context(|| format!("failed reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

pub fn ensure_dir(path: &Path) -> HarnessResult<()> {
    fs::create_dir_all(path).io_context(|| format!("failed creating {}", path.display()))
}

/// Removes whatever is at `path`, file or directory tree.
pub fn remove_if_exists(path: &Path) -> HarnessResult<()> {
    if !path.exists() {
        return Ok(());
    }
    tracing::info!(path = %path.display(), "removing existing path");
    if path.is_dir() {
        fs::remove_dir_all(path).io_context(|| format!("failed removing {}", path.display()))
    } else {
        fs::remove_file(path).io_context(|| format!("failed removing {}", path.display()))
    }
}

/// Removes whatever is at `path` and recreates it as an empty directory.
pub fn reset_dir(path: &Path) -> HarnessResult<()> {
    remove_if_exists(path)?;
    ensure_dir(path)
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> HarnessResult<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    if let Err(err) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(HarnessError::io(
            format!("failed writing {}", path.display()),
            err,
        ));
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> HarnessResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Last `max_lines` lines of a text file, lossily decoded. Missing files read
/// as empty.
pub fn tail_lines(path: &Path, max_lines: usize) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    tail_text(&String::from_utf8_lossy(&bytes), max_lines)
}

pub fn tail_text(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

pub fn truncate_chars(raw: &str, max_chars: usize) -> String {
    let normalized = raw.replace('\n', " ");
    if normalized.chars().count() <= max_chars {
        return normalized;
    }
    normalized.chars().take(max_chars).collect()
}

/// Shared interrupt flag. Cloned into the signal handler and checked at every
/// phase boundary and inside every polling loop.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, phase: &str) -> HarnessResult<()> {
        if self.is_cancelled() {
            return Err(HarnessError::Interrupted {
                phase: phase.to_string(),
            });
        }
        Ok(())
    }
}

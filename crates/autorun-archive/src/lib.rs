use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use autorun_core::config::LayoutConventions;
use autorun_core::model::{ExtractedProject, ServiceLocation};
use autorun_core::{reset_dir, HarnessError, HarnessResult, IoResultExt};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Picks exactly one archive: an explicit path when it is usable, then the
/// known filename hints, then the lexically first file with the expected
/// extension in `search_dir`.
pub fn resolve_archive(
    search_dir: &Path,
    explicit: Option<&Path>,
    layout: &LayoutConventions,
) -> HarnessResult<PathBuf> {
    if let Some(candidate) = explicit {
        if candidate.is_file() && has_extension(candidate, &layout.archive_extension) {
            return Ok(absolute(candidate));
        }
        warn!(
            path = %candidate.display(),
            "provided path is not a .{} file; searching {}",
            layout.archive_extension,
            search_dir.display()
        );
    }

    for hint in &layout.archive_name_hints {
        let candidate = search_dir.join(hint);
        if candidate.is_file() {
            debug!(hint = %hint, "archive matched filename hint");
            return Ok(absolute(&candidate));
        }
    }

    let mut matches = Vec::new();
    if let Ok(entries) = fs::read_dir(search_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && has_extension(&path, &layout.archive_extension) {
                matches.push(path);
            }
        }
    }
    matches.sort();
    matches
        .into_iter()
        .next()
        .map(|p| absolute(&p))
        .ok_or_else(|| HarnessError::ArchiveNotFound {
            search_dir: search_dir.to_path_buf(),
        })
}

/// `<work_dir>/<archive stem>`.
pub fn default_extract_dir(work_dir: &Path, archive: &Path) -> PathBuf {
    let stem = archive
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("extracted");
    work_dir.join(stem)
}

/// Refuses an extraction root that would take any of `protected` with it
/// when wiped. Paths are compared after resolving symlinks and `..`.
pub fn guard_extract_root(
    archive: &Path,
    extract_root: &Path,
    protected: &[&Path],
) -> HarnessResult<()> {
    let root = normalize(extract_root);
    for path in protected {
        if normalize(path).starts_with(&root) {
            return Err(HarnessError::ArchiveExtractFailed {
                archive: archive.to_path_buf(),
                detail: format!(
                    "extraction directory {} contains {}; refusing to wipe it",
                    extract_root.display(),
                    path.display()
                ),
            });
        }
    }
    Ok(())
}

/// Wipes `extract_root`, unpacks the archive into it and re-roots into a
/// single wrapping folder when there is one. The archive itself must live
/// outside `extract_root`.
pub fn extract_archive(archive: &Path, extract_root: &Path) -> HarnessResult<ExtractedProject> {
    guard_extract_root(archive, extract_root, &[archive])?;
    reset_dir(extract_root)?;
    info!(
        archive = %archive.display(),
        dest = %extract_root.display(),
        "extracting archive"
    );
    let extract_failed = |detail: String| HarnessError::ArchiveExtractFailed {
        archive: archive.to_path_buf(),
        detail,
    };

    let file = fs::File::open(archive)
        .io_context(|| format!("failed opening archive {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| extract_failed(e.to_string()))?;

    let mut files = 0usize;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| extract_failed(e.to_string()))?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(name = %entry.name(), "skipping archive entry with unsafe path");
            continue;
        };
        let out_path = extract_root.join(&rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .io_context(|| format!("failed creating {}", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("failed creating {}", parent.display()))?;
        }
        let mut out = fs::File::create(&out_path)
            .io_context(|| format!("failed creating {}", out_path.display()))?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| extract_failed(format!("{}: {}", rel.display(), e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777));
            }
        }
        files += 1;
    }
    debug!(files, "archive extracted");

    let project_root = reroot(extract_root)?;
    info!(project_root = %project_root.display(), "project root resolved");
    Ok(ExtractedProject {
        extract_root: extract_root.to_path_buf(),
        project_root,
    })
}

/// Steps into the only child when the extraction holds exactly one directory
/// and no sibling files.
pub fn reroot(extract_root: &Path) -> HarnessResult<PathBuf> {
    let mut dirs = Vec::new();
    let mut has_files = false;
    let entries = fs::read_dir(extract_root)
        .io_context(|| format!("failed listing {}", extract_root.display()))?;
    for entry in entries {
        let entry = entry.io_context(|| format!("failed listing {}", extract_root.display()))?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        } else {
            has_files = true;
        }
    }
    if dirs.len() == 1 && !has_files {
        return Ok(dirs.remove(0));
    }
    Ok(extract_root.to_path_buf())
}

/// Every directory holding both the entry point and the manifest is a
/// candidate. Candidates under the recognized project folder win, then the
/// shortest path string.
pub fn locate_service(
    project_root: &Path,
    layout: &LayoutConventions,
) -> HarnessResult<ServiceLocation> {
    let mut candidates: Vec<PathBuf> = WalkDir::new(project_root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .filter(|dir| {
            dir.join(&layout.entry_point).is_file() && dir.join(&layout.manifest).is_file()
        })
        .collect();

    if candidates.is_empty() {
        return Err(HarnessError::ServiceNotFound {
            root: project_root.to_path_buf(),
            entry_point: layout.entry_point.clone(),
            manifest: layout.manifest.clone(),
        });
    }

    candidates.sort_by_key(|dir| {
        (
            !contains_component(dir, &layout.project_root_hint),
            dir.as_os_str().len(),
            dir.clone(),
        )
    });
    if candidates.len() > 1 {
        debug!(count = candidates.len(), "multiple service directories found");
    }
    let service_dir = candidates.swap_remove(0);
    info!(service_dir = %service_dir.display(), "located service directory");
    Ok(ServiceLocation {
        entry_point: service_dir.join(&layout.entry_point),
        manifest: service_dir.join(&layout.manifest),
        service_dir,
    })
}

fn contains_component(path: &Path, name: &str) -> bool {
    !name.is_empty()
        && path
            .components()
            .any(|c| matches!(c, Component::Normal(part) if part == name))
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension.trim_start_matches('.')))
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Canonical form of a path that may not exist yet: the deepest existing
/// ancestor is canonicalized and the missing tail re-appended.
fn normalize(path: &Path) -> PathBuf {
    let path = if path.is_relative() {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    } else {
        path.to_path_buf()
    };
    let mut missing = Vec::new();
    let mut cursor = path.as_path();
    loop {
        if let Ok(real) = fs::canonicalize(cursor) {
            return missing.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match (cursor.parent(), cursor.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                cursor = parent;
            }
            _ => return path,
        }
    }
}

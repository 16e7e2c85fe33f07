//! Input resolution for the transcoder
//!
//! Turns the command line's input arguments into a list of video files. Each
//! argument is an existing file, a directory to walk, or a glob pattern.

use globset::{GlobBuilder, GlobMatcher};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Video file extensions picked up from directories (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mkv", ".mp4", ".avi", ".mov", ".m4v", ".ts", ".m2ts", ".webm", ".wmv", ".flv",
];

/// Error types for input resolution
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid input pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Resolve every input argument, keeping argument order
///
/// Matches of a single argument are sorted. Duplicates across arguments are
/// kept; the pipeline drops them. An argument matching nothing only logs a
/// warning.
pub fn resolve_inputs(patterns: &[String]) -> Result<Vec<PathBuf>, ScanError> {
    let mut inputs = Vec::new();

    for pattern in patterns {
        let matched = resolve_pattern(pattern)?;
        if matched.is_empty() {
            warn!(pattern = %pattern, "input matched no files");
        } else {
            debug!(pattern = %pattern, files = matched.len(), "input resolved");
        }
        inputs.extend(matched);
    }

    Ok(inputs)
}

/// Resolve one input argument
pub fn resolve_pattern(pattern: &str) -> Result<Vec<PathBuf>, ScanError> {
    let path = Path::new(pattern);

    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if path.is_dir() {
        return Ok(scan_directory(path));
    }
    if !has_glob_meta(pattern) {
        return Ok(Vec::new());
    }

    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|source| ScanError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?
        .compile_matcher();

    Ok(walk_glob(pattern, &matcher))
}

/// Recursively collect video files below `root`, skipping hidden directories
pub fn scan_directory(root: &Path) -> Vec<PathBuf> {
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if entry.file_type().is_dir() && entry.depth() > 0 {
            if let Some(name) = entry.file_name().to_str() {
                return !name.starts_with('.');
            }
        }
        true
    });

    let mut files: Vec<PathBuf> = walker
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && is_video_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '[', '{'])
}

/// Split a glob into the directory to walk from and the number of path
/// components below it the pattern can reach (None when it contains `**`)
fn glob_base(pattern: &str) -> (PathBuf, Option<usize>) {
    let mut base = PathBuf::new();
    let mut rest = 0;
    let mut in_glob = false;

    for component in Path::new(pattern).components() {
        let is_meta = match component {
            Component::Normal(part) => has_glob_meta(&part.to_string_lossy()),
            _ => false,
        };
        if in_glob || is_meta {
            in_glob = true;
            rest += 1;
        } else {
            base.push(component);
        }
    }

    let depth = if pattern.contains("**") { None } else { Some(rest) };
    (base, depth)
}

fn walk_glob(pattern: &str, matcher: &GlobMatcher) -> Vec<PathBuf> {
    let (base, depth) = glob_base(pattern);
    let relative = base.as_os_str().is_empty();
    let root = if relative { PathBuf::from(".") } else { base };

    let mut walker = WalkDir::new(&root);
    if let Some(depth) = depth {
        walker = walker.max_depth(depth);
    }

    let mut files: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let path = entry.into_path();
            if relative {
                path.strip_prefix(".").map(Path::to_path_buf).unwrap_or(path)
            } else {
                path
            }
        })
        .filter(|path| matcher.is_match(path))
        .collect();
    files.sort();
    files
}

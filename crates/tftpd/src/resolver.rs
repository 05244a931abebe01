//! Content-addressed resolver (§4.4): resolves a plain filename or a
//! 32-hex-digest request to a concrete payload path under the configured
//! root and search directories.
//!
//! The digest-search algorithm is grounded on the original data manager's
//! `search_by_md5`/`full_search_md5` (depth-first walk of each root in
//! configured order, first matching `*.md5` sidecar wins); see
//! SPEC_FULL.md §F for the exact candidate-resolution order.

use std::fs;
use std::path::{Path, PathBuf};

/// True if `name` is exactly 32 hex digits (§4.4 step 1 classification).
pub fn is_digest_request(name: &str) -> bool {
    name.len() == 32 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Resolves a plain (non-digest) filename: `root/name`, then each search
/// directory's `name`, first existing regular file wins.
pub fn resolve_plain_name(root: &Path, search_dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    let candidate = root.join(name);
    if candidate.is_file() {
        return Some(candidate);
    }
    for dir in search_dirs {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Resolves a 32-hex digest request by walking `root` and then each search
/// directory, depth-first, looking for a `.md5` sidecar whose first line
/// captures the requested digest.
pub fn resolve_digest(root: &Path, search_dirs: &[PathBuf], digest: &str) -> Option<PathBuf> {
    let digest_lower = digest.to_ascii_lowercase();

    if let Some(path) = search_root_for_digest(root, &digest_lower) {
        return Some(path);
    }
    for dir in search_dirs {
        if let Some(path) = search_root_for_digest(dir, &digest_lower) {
            return Some(path);
        }
    }
    None
}

fn search_root_for_digest(root: &Path, digest_lower: &str) -> Option<PathBuf> {
    for sidecar in walk_files_depth_first(root) {
        let is_md5 = sidecar
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase() == "md5")
            .unwrap_or(false);
        if !is_md5 {
            continue;
        }
        let Some((found_digest, filename_token)) = read_first_line_digest(&sidecar) else {
            continue;
        };
        if found_digest != digest_lower {
            continue;
        }
        // Candidate (a): same path minus ".md5"
        let stripped = sidecar.with_extension("");
        if stripped.is_file() {
            return Some(stripped);
        }
        // Candidate (b): sidecar's directory + filename token on the line
        if let Some(token) = filename_token
            && let Some(parent) = sidecar.parent()
        {
            let candidate = parent.join(token);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        // No candidate exists yet; keep scanning per §4.4.
    }
    None
}

/// Reads the first line of a sidecar file (bounded, matching the source's
/// 2048-byte cap) and extracts the first 32-hex-digit run plus any
/// whitespace-separated filename token that follows it on the same line.
fn read_first_line_digest(path: &Path) -> Option<(String, Option<String>)> {
    let contents = fs::read(path).ok()?;
    let bounded = &contents[..contents.len().min(2048)];
    let first_line = bounded
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or(bounded);
    let line = String::from_utf8_lossy(first_line);

    let bytes = line.as_bytes();
    let mut i = 0;
    while i + 32 <= bytes.len() {
        let candidate = &line[i..i + 32];
        if candidate.bytes().all(|b| b.is_ascii_hexdigit()) {
            let digest = candidate.to_ascii_lowercase();
            let rest = line[i + 32..].trim_start();
            let token = rest.split_whitespace().next().map(|s| s.to_string());
            return Some((digest, token));
        }
        i += 1;
    }
    None
}

/// Depth-first regular-file walk in filesystem-reported directory order,
/// matching the source's `recursive_directory_iterator` behavior closely
/// enough to keep resolution deterministic for a fixed filesystem state.
fn walk_files_depth_first(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    walk_into(root, &mut out);
    out
}

fn walk_into(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk_into(&path, out);
        } else if file_type.is_file() {
            out.push(path);
        }
    }
}

//! Filesystem utilities.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Recursively copy a directory.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .with_context(|| format!("failed to create directory: {}", dst.display()))?;

    for entry in
        fs::read_dir(src).with_context(|| format!("failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let ty = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            copy_dir_all(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    src_path.display(),
                    dst_path.display()
                )
            })?;
        }
    }
    Ok(())
}

/// Ensure a directory exists, creating it if necessary.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory: {}", path.display()))?;
    }
    Ok(())
}

/// Read a file to string, with nice error messages.
pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read file: {}", path.display()))
}

/// Write a string to a file, creating parent directories if needed.
pub fn write_string(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("failed to write file: {}", path.display()))
}

/// Copy a file, creating the destination's parent directories if needed.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

/// Return every file under `root`, sorted, without descending into any of
/// `ignore_folders`.
///
/// The prebuild folder holds multiple cached versions of generated sources,
/// so source discovery must not walk into it.
pub fn file_walk(root: &Path, ignore_folders: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        !ignore_folders
            .iter()
            .any(|ignored| entry.path() == ignored.as_path())
    });

    for entry in walker {
        let entry =
            entry.with_context(|| format!("failed to walk directory: {}", root.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

/// Case-sensitive file extension, including the dot.
pub fn suffix(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// Keep only the paths carrying one of the wanted suffixes.
pub fn suffix_filter<'a>(
    paths: impl IntoIterator<Item = &'a PathBuf>,
    suffixes: &[&str],
) -> Vec<PathBuf> {
    paths
        .into_iter()
        .filter(|p| suffixes.contains(&suffix(p).as_str()))
        .cloned()
        .collect()
}

/// Map a path in the source folder to the equivalent path under the output
/// folder. Paths already under the output folder are returned unchanged;
/// paths outside the workspace entirely are re-rooted below the output
/// folder.
pub fn input_to_output_fpath(source_root: &Path, build_output: &Path, input: &Path) -> PathBuf {
    if input.starts_with(build_output) {
        return input.to_path_buf();
    }

    if let Ok(rel) = input.strip_prefix(source_root) {
        return build_output.join(rel);
    }

    // Outside the workspace, e.g. source discovery pointed elsewhere.
    let tail: PathBuf = input.components().skip(1).collect();
    build_output.join(tail)
}

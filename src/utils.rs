use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

pub const OUTPUT_EXTENSION: &str = "mp4";
pub const STAGING_EXTENSION: &str = "m4s";

pub fn random_name() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Where the combined file goes: `<dir>/<name>.mp4`, random when `name` is blank.
pub fn resolve_output_path(output_dir: &Path, name: Option<&str>) -> PathBuf {
    let name = name.map(str::trim).filter(|n| !n.is_empty());
    let mut filename = match name {
        Some(name) => sanitize_filename(name),
        None => random_name(),
    };
    let suffix = format!(".{}", OUTPUT_EXTENSION);
    if !filename.to_lowercase().ends_with(&suffix) {
        filename.push_str(&suffix);
    }
    output_dir.join(filename)
}

/// A fresh staging file path inside the cache directory.
pub fn staging_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(format!("{}.{}", random_name(), STAGING_EXTENSION))
}

pub async fn create_cache(cache_dir: &Path) -> Result<()> {
    fs::create_dir_all(cache_dir)
        .await
        .with_context(|| format!("Failed to create cache directory {:?}", cache_dir))
}

pub async fn clear_cache(cache_dir: &Path) -> Result<()> {
    if fs::metadata(cache_dir).await.is_ok() {
        fs::remove_dir_all(cache_dir)
            .await
            .with_context(|| format!("Failed to remove cache directory {:?}", cache_dir))?;
    }
    Ok(())
}

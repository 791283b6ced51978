use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TEMP_PREFIX: &str = "temp_";

/// An uploaded audio buffer materialized on disk for the duration of one request
///
/// The file is removed when the guard is dropped, whichever way the request ends.
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    /// Writes `bytes` to `dir/temp_{unix_millis}_{uuid}.{extension}`
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or the file cannot be written
    pub async fn create(dir: &Path, bytes: &[u8], extension: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create upload directory {}", dir.display()))?;

        let path = dir.join(format!(
            "{TEMP_PREFIX}{}_{}.{extension}",
            unix_millis(SystemTime::now())?,
            uuid::Uuid::new_v4().simple()
        ));

        // Guard first so a partial write is still cleaned up
        let upload = Self { path };
        tokio::fs::write(&upload.path, bytes)
            .await
            .with_context(|| format!("failed to write upload {}", upload.path.display()))?;

        tracing::debug!(path = %upload.path.display(), bytes = bytes.len(), "upload materialized");
        Ok(upload)
    }

    /// Location of the materialized upload
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "upload removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("failed to remove upload {}: {}", self.path.display(), e),
        }
    }
}

/// Delete `temp_*` uploads older than `max_age` left behind by a previous process
///
/// Returns the number of files deleted.
///
/// # Errors
/// Returns error if directory listing fails. Individual file deletion failures are logged but don't stop cleanup.
pub fn cleanup_stale_uploads(dir: &Path, max_age: Duration) -> Result<usize> {
    if !dir.exists() {
        tracing::debug!("upload directory does not exist, skipping cleanup");
        return Ok(0);
    }

    let now = unix_millis(SystemTime::now())?;
    let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);

    let stale: Vec<PathBuf> = fs::read_dir(dir)
        .context("failed to read upload directory")?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(upload_timestamp)
                .is_some_and(|created| now.saturating_sub(created) > max_age_ms)
        })
        .collect();

    let mut deleted_count = 0;
    for path in stale {
        match fs::remove_file(&path) {
            Ok(()) => {
                deleted_count += 1;
                tracing::debug!("deleted stale upload: {}", path.display());
            }
            Err(e) => {
                tracing::warn!("failed to delete {}: {}", path.display(), e);
            }
        }
    }

    if deleted_count > 0 {
        tracing::info!(deleted = deleted_count, dir = %dir.display(), "stale uploads removed");
    }

    Ok(deleted_count)
}

/// Extract the creation time from `temp_{millis}_{id}.{ext}`
fn upload_timestamp(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(TEMP_PREFIX)?
        .split(['_', '.'])
        .next()?
        .parse()
        .ok()
}

fn unix_millis(time: SystemTime) -> Result<u64> {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .context("failed to get current time")?
        .as_millis();
    u64::try_from(millis).context("timestamp out of range")
}

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};

/// Rotation policy for the service's own log files.
#[derive(Clone, Debug)]
pub struct RotationPolicy {
    /// Maximum size of the active log file before it is rotated away.
    pub max_file_size: u64,
    /// Rotated files kept before the oldest are deleted.
    pub max_files: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            max_files: 10,
        }
    }
}

impl RotationPolicy {
    /// Rotates the newest matching file if it grew past the size limit and
    /// prunes the oldest files beyond the retention count. Run at startup,
    /// before the tracing appender opens the active file.
    pub fn rotate(&self, log_dir: &Path, prefix: &str) -> std::io::Result<()> {
        let files = find_log_files(log_dir, prefix)?;
        if files.is_empty() {
            return Ok(());
        }

        let latest = &files[files.len() - 1];
        if fs::metadata(latest)?.len() > self.max_file_size {
            let timestamp = Local::now().format("%Y%m%d_%H%M%S");
            let stem = latest
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let parent = latest.parent().unwrap_or(log_dir);
            fs::rename(latest, parent.join(format!("{}.{}", stem, timestamp)))?;
        }

        let files = find_log_files(log_dir, prefix)?;
        if files.len() > self.max_files {
            for file in files.iter().take(files.len() - self.max_files) {
                let _ = fs::remove_file(file);
            }
        }

        Ok(())
    }
}

/// Files under `log_dir` starting with `prefix`, oldest first by mtime.
fn find_log_files(log_dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !log_dir.exists() {
        return Ok(files);
    }

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with(prefix))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }

    files.sort_by_key(|path| {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });

    Ok(files)
}

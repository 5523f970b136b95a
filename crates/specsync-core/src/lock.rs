use crate::error::{Result, SyncError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Advisory file lock scoped to one output path. Created with
/// `create_new` so acquisition is atomic; the owning process id is written
/// into the file to make a stuck lock diagnosable. Released on drop.
///
/// Parallel runs over the same immutable graph need no coordination; this
/// lock exists only so two runs targeting the same output file cannot
/// interleave their write critical sections.
#[derive(Debug)]
pub struct PathLock {
    lock_file: PathBuf,
}

impl PathLock {
    /// Block until the lock is acquired or `timeout` expires. Polling
    /// interval is coarse; lock hold times are milliseconds.
    pub fn acquire(output: &Path, timeout: Duration) -> Result<PathLock> {
        let lock_file = crate::io::lock_path(output);
        if let Some(parent) = lock_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + timeout;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_file)
            {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(PathLock { lock_file });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        let pid = std::fs::read_to_string(&lock_file)
                            .ok()
                            .and_then(|s| s.trim().parse().ok());
                        return Err(SyncError::LockTimeout {
                            path: lock_file.display().to_string(),
                            seconds: timeout.as_secs(),
                            pid,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        // Best effort; a leaked lock file is visible and carries the pid.
        std::fs::remove_file(&self.lock_file).ok();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use fs4::fs_std::FileExt;
use thiserror::Error;

const PID_FILE: &str = "wades.pid";
const LOG_FILE: &str = "wades.log";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("another daemon already holds the store at {0:?}")]
    AlreadyRunning(PathBuf),
    #[error("no daemon is running (no readable pid file)")]
    NotRunning,
    #[error("the pid file {0:?} does not contain a pid")]
    MalformedPidFile(PathBuf),
    #[error("could not signal the daemon: {0}")]
    Signal(std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Exclusive lock on the store root's pid file, held for the daemon's
/// lifetime. Two daemons sharing one store directory would interleave
/// writes, so the second acquisition fails fast.
pub struct PidLock {
    file: File,
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(store_root: &Path) -> Result<PidLock, DaemonError> {
        fs::create_dir_all(store_root)?;
        let path = store_root.join(PID_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(true) => {}
            Ok(false) => return Err(DaemonError::AlreadyRunning(path)),
            Err(err) if err.raw_os_error() == fs4::lock_contended_error().raw_os_error() => {
                return Err(DaemonError::AlreadyRunning(path));
            }
            Err(err) => return Err(DaemonError::Io(err)),
        }
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(PidLock { file, path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Spawns a detached `wades run` child with its stderr appended to the
/// store's log file, and returns the child's pid. The child acquires the
/// pid lock itself and rewrites the pid file with its own pid.
pub fn spawn_daemon(config_path: Option<&Path>, store_root: &Path) -> Result<u32, DaemonError> {
    fs::create_dir_all(store_root)?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(store_root.join(LOG_FILE))?;

    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command.arg("run");
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    if std::env::var_os("RUST_LOG").is_none() {
        command.env("RUST_LOG", "info");
    }
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log))
        .spawn()?;
    Ok(child.id())
}

/// Signals the recorded daemon with SIGTERM and returns its pid.
pub fn stop_daemon(store_root: &Path) -> Result<u32, DaemonError> {
    let path = store_root.join(PID_FILE);
    let mut contents = String::new();
    File::open(&path)
        .map_err(|_| DaemonError::NotRunning)?
        .read_to_string(&mut contents)?;
    let pid: i32 = contents
        .trim()
        .parse()
        .map_err(|_| DaemonError::MalformedPidFile(path.clone()))?;
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        return Err(DaemonError::Signal(std::io::Error::last_os_error()));
    }
    Ok(pid as u32)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn second_acquisition_fails_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let lock = PidLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            PidLock::acquire(dir.path()),
            Err(DaemonError::AlreadyRunning(_))
        ));
        drop(lock);
        assert!(PidLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn pid_file_records_this_process() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = PidLock::acquire(dir.path()).unwrap();
        let contents = fs::read_to_string(dir.path().join(PID_FILE)).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn stopping_without_a_pid_file_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            stop_daemon(dir.path()),
            Err(DaemonError::NotRunning)
        ));
    }
}

//! Exclusive lock over a state directory.
//!
//! Held by a cache store for as long as it is open so that two kiln processes
//! never mutate the same index concurrently. A lock left behind by a dead
//! process is reclaimed.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = ".lock";

#[derive(Debug)]
pub struct StoreLock {
    lock_file: File,
    lock_path: PathBuf,
    pid: u32,
}

impl StoreLock {
    /// Try to acquire the lock without blocking
    pub fn try_acquire(directory: &Path) -> io::Result<Self> {
        Self::try_acquire_inner(directory, true)
    }

    fn try_acquire_inner(directory: &Path, reclaim_stale: bool) -> io::Result<Self> {
        fs::create_dir_all(directory)?;
        let lock_path = directory.join(LOCK_FILE_NAME);

        let mut lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                let pid = std::process::id();
                lock_file.set_len(0)?;
                writeln!(lock_file, "{pid}")?;
                lock_file.sync_all()?;
                Ok(Self {
                    lock_file,
                    lock_path,
                    pid,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || is_lock_contended(&e) => {
                if reclaim_stale {
                    if let Some(owner) = read_owner(&lock_path) {
                        if !is_process_running(owner) {
                            drop(lock_file);
                            fs::remove_file(&lock_path)?;
                            return Self::try_acquire_inner(directory, false);
                        }
                    }
                }
                Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!("store already in use: {}", directory.display()),
                ))
            }
            Err(e) => Err(e),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock_file);
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn is_lock_contended(err: &io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn read_owner(lock_path: &Path) -> Option<u32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

fn is_process_running(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }

    #[cfg(unix)]
    {
        // Signal 0 only probes for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        true
    }
}

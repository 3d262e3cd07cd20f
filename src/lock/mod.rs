//! Lock Manager (C5): six kinds of process-wide advisory locks over
//! `libc::flock`, each a `Drop`-releasing RAII guard, mirroring the
//! teacher's `StoreKeyMutexGuard` pattern in `storage/store_lock.rs` but
//! backed by real file locks rather than an in-process mutex, since the
//! contract here is explicitly cross-process.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};

fn try_lock(file: &File, op: i32) -> io::Result<bool> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if ret == 0 {
        Ok(true)
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

fn unlock(file: &File) {
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

fn wait_for_exclusive(file: &File, path: &Path, config: &Config) -> Result<()> {
    let deadline = Instant::now() + config.write_lock_timeout();
    loop {
        if try_lock(file, libc::LOCK_EX).map_err(|e| Error::io(path, e))? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Locked(format!(
                "timed out acquiring exclusive lock on {}",
                path.display()
            )));
        }
        thread::sleep(config.write_lock_check_interval());
    }
}

fn tag(prefix: &str) -> String {
    format!(
        "{prefix}:{}:{}:{:?}",
        uuid::Uuid::new_v4(),
        std::process::id(),
        thread::current().id()
    )
}

/// Held while a Client is creating a Collection (`<name>.lock`); doubles as
/// the permanent sentinel the integrity checker expects to find for every
/// collection, so it is never deleted on drop.
#[derive(Debug)]
pub struct CollectionCreateGuard {
    file: File,
}

impl CollectionCreateGuard {
    /// Acquire (creating if necessary) the collection sentinel lock.
    ///
    /// # Errors
    /// Returns [`Error::Locked`] on timeout, or [`Error::Io`] on I/O failure.
    pub fn acquire(storage_root: &Path, collection_name: &str, config: &Config) -> Result<Self> {
        let path = storage_root.join(format!("{collection_name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        wait_for_exclusive(&file, &path, config)?;
        Ok(Self { file })
    }
}

impl Drop for CollectionCreateGuard {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

/// Held while creating a single Array/VArray with a given id
/// (`<id>:<uuid>:<pid>:<tid>.arrlock`); conflicts with any other in-flight
/// create lock for the same id.
#[derive(Debug)]
pub struct CreateArrayGuard {
    file: File,
    path: PathBuf,
}

impl CreateArrayGuard {
    /// Acquire a create lock for `id` under `collection_root`.
    ///
    /// # Errors
    /// Returns [`Error::Locked`] on timeout, or [`Error::Io`] on I/O failure.
    pub fn acquire(collection_root: &Path, id: &str, config: &Config) -> Result<Self> {
        let prefix = format!("{id}:");
        let deadline = Instant::now() + config.write_lock_timeout();
        loop {
            if !has_sibling_with(collection_root, &prefix, ".arrlock")? {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Locked(format!(
                    "timed out waiting for a create lock on id {id}"
                )));
            }
            thread::sleep(config.write_lock_check_interval());
        }

        let path = collection_root.join(format!("{}.arrlock", tag(id)));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        if !try_lock(&file, libc::LOCK_EX).map_err(|e| Error::io(&path, e))? {
            return Err(Error::Locked(format!(
                "could not lock newly created file {}",
                path.display()
            )));
        }
        Ok(Self { file, path })
    }
}

impl Drop for CreateArrayGuard {
    fn drop(&mut self) {
        unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Held for the duration of a read against an Array payload
/// (`<id>:<uuid>:<pid>:<tid>.arrayreadlock`). Conflicts with a write lock on
/// the same payload.
#[derive(Debug)]
pub struct ReadArrayGuard {
    payload_lock: File,
    sentinel_path: PathBuf,
}

impl ReadArrayGuard {
    /// Acquire a read lock on `payload_path`.
    ///
    /// # Errors
    /// Returns [`Error::Locked`] if the payload is currently locked for
    /// update, or [`Error::Io`] on I/O failure.
    pub fn acquire(payload_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(payload_path)
            .map_err(|e| Error::io(payload_path, e))?;
        if !try_lock(&file, libc::LOCK_SH).map_err(|e| Error::io(payload_path, e))? {
            return Err(Error::Locked(format!(
                "{} is locked for update",
                payload_path.display()
            )));
        }
        let dir = payload_path.parent().unwrap_or_else(|| Path::new("."));
        let sentinel_path = dir.join(format!("{}.arrayreadlock", tag("array")));
        fs::write(&sentinel_path, std::process::id().to_string())
            .map_err(|e| Error::io(&sentinel_path, e))?;
        Ok(Self {
            payload_lock: file,
            sentinel_path,
        })
    }
}

impl Drop for ReadArrayGuard {
    fn drop(&mut self) {
        unlock(&self.payload_lock);
        let _ = fs::remove_file(&self.sentinel_path);
    }
}

/// Held for the duration of a write/clear against an Array payload: takes
/// the payload's flock, then busy-waits for any conflicting reader or
/// foreign varray tile lock to clear.
#[derive(Debug)]
pub struct WriteArrayGuard {
    file: File,
}

impl WriteArrayGuard {
    /// Acquire a write lock on `payload_path`.
    ///
    /// # Errors
    /// Returns [`Error::Locked`] on timeout, or [`Error::Io`] on I/O failure.
    pub fn acquire(payload_path: &Path, config: &Config) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(payload_path)
            .map_err(|e| Error::io(payload_path, e))?;
        wait_for_exclusive(&file, payload_path, config)?;

        let dir = payload_path.parent().unwrap_or_else(|| Path::new("."));
        let deadline = Instant::now() + config.write_lock_timeout();
        loop {
            if !has_conflicting_sentinel(dir, std::process::id())? {
                break;
            }
            if Instant::now() >= deadline {
                unlock(&file);
                return Err(Error::Locked(format!(
                    "timed out waiting for readers/foreign tile locks on {}",
                    payload_path.display()
                )));
            }
            thread::sleep(config.write_lock_check_interval());
        }
        Ok(Self { file })
    }
}

impl Drop for WriteArrayGuard {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

/// Held for the duration of a custom-attribute update against a payload.
/// Distinct type from [`WriteArrayGuard`] per §4.5's lock table, though the
/// underlying mechanism (exclusive flock on the payload) is the same.
#[derive(Debug)]
pub struct UpdateMetaGuard {
    file: File,
}

impl UpdateMetaGuard {
    /// Acquire an update-metadata lock on `payload_path`.
    ///
    /// # Errors
    /// Returns [`Error::Locked`] on timeout, or [`Error::Io`] on I/O failure.
    pub fn acquire(payload_path: &Path, config: &Config) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(payload_path)
            .map_err(|e| Error::io(payload_path, e))?;
        wait_for_exclusive(&file, payload_path, config)?;
        Ok(Self { file })
    }
}

impl Drop for UpdateMetaGuard {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

struct TileLock {
    sentinel_path: PathBuf,
    file: Option<File>,
    created_sentinel: bool,
}

impl Drop for TileLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            unlock(file);
        }
        if self.created_sentinel {
            let _ = fs::remove_file(&self.sentinel_path);
        }
    }
}

/// Held across every tile touched by a single VArray write/clear
/// (`<payload>:<pid>.varraylock` per tile). A tile already sentineled by
/// this same process (e.g. an Array write nested inside the VArray
/// operation that owns it) elides re-locking to avoid self-deadlock; this
/// is a documented correctness boundary, not a generalized cross-process
/// guarantee -- two processes sharing a PID namespace in unusual ways are
/// out of scope.
#[derive(Debug)]
pub struct WriteVArrayGuard {
    #[allow(dead_code)]
    locks: Vec<TileLock>,
}

impl WriteVArrayGuard {
    /// Acquire locks on every tile payload path in `payload_paths`. If any
    /// tile cannot be locked within `config.write_lock_timeout()`, every
    /// already-acquired tile lock is released before returning.
    ///
    /// # Errors
    /// Returns [`Error::Locked`] on timeout, or [`Error::Io`] on I/O failure.
    pub fn acquire(payload_paths: &[PathBuf], config: &Config) -> Result<Self> {
        let mut locks = Vec::with_capacity(payload_paths.len());
        for path in payload_paths {
            match acquire_tile(path, config) {
                Ok(lock) => locks.push(lock),
                Err(e) => return Err(e),
            }
        }
        Ok(Self { locks })
    }
}

fn acquire_tile(payload_path: &Path, config: &Config) -> Result<TileLock> {
    let our_pid = std::process::id();
    let dir = payload_path.parent().unwrap_or_else(|| Path::new("."));
    let payload_name = payload_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let sentinel_path = dir.join(format!("{payload_name}:{our_pid}.varraylock"));

    if sentinel_path.exists() {
        return Ok(TileLock {
            sentinel_path,
            file: None,
            created_sentinel: false,
        });
    }

    let deadline = Instant::now() + config.write_lock_timeout();
    loop {
        if !has_conflicting_sentinel(dir, our_pid)? {
            break;
        }
        if Instant::now() >= deadline {
            return Err(Error::Locked(format!(
                "timed out acquiring varray tile lock on {}",
                payload_path.display()
            )));
        }
        thread::sleep(config.write_lock_check_interval());
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(payload_path)
        .map_err(|e| Error::io(payload_path, e))?;
    wait_for_exclusive(&file, payload_path, config)?;
    fs::write(&sentinel_path, our_pid.to_string()).map_err(|e| Error::io(&sentinel_path, e))?;
    Ok(TileLock {
        sentinel_path,
        file: Some(file),
        created_sentinel: true,
    })
}

fn has_sibling_with(dir: &Path, prefix: &str, suffix: &str) -> Result<bool> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix) && name.ends_with(suffix) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn has_conflicting_sentinel(dir: &Path, our_pid: u32) -> Result<bool> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with("arrayreadlock") {
            return Ok(true);
        }
        if name.ends_with(".varraylock") {
            match varraylock_pid(&name) {
                Some(pid) if pid == our_pid => {}
                _ => return Ok(true),
            }
        }
    }
    Ok(false)
}

/// Whether `pid` names a process currently alive on this host, used by the
/// integrity checker to distinguish a genuinely stale lock sentinel (its
/// owning process is gone) from one still legitimately held.
#[must_use]
pub(crate) fn process_is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn varraylock_pid(name: &str) -> Option<u32> {
    let stripped = name.strip_suffix(".varraylock")?;
    stripped.rsplit(':').next()?.parse().ok()
}

/// A lock kind discoverable via [`scan_locks`], mirroring §4.5's extension table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// `<name>.lock` collection sentinel.
    CollectionCreate,
    /// `<id>:*.arrlock` array/varray creation lock.
    CreateArray,
    /// `<id>:*.arrayreadlock` array read lock.
    ReadArray,
    /// `<payload>:<pid>.varraylock` varray tile write lock.
    WriteVArray,
}

/// A single lock file found on disk, with its kind and the pid embedded in
/// its filename (if any).
#[derive(Debug, Clone)]
pub struct LockDescriptor {
    /// The lock file's path.
    pub path: PathBuf,
    /// The kind of lock this file represents.
    pub kind: LockKind,
    /// The pid that created the lock, parsed from its filename where present.
    pub pid: Option<u32>,
}

/// Walk `root` (recursively) collecting every lock file, optionally
/// restricted to `kind_filter`.
///
/// # Errors
/// Returns [`Error::Io`] on a directory walk failure.
pub fn scan_locks(root: &Path, kind_filter: Option<LockKind>) -> Result<Vec<LockDescriptor>> {
    let mut found = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            Error::io(
                e.path().unwrap_or(root).to_path_buf(),
                io::Error::new(io::ErrorKind::Other, e.to_string()),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let descriptor = if name.ends_with(".lock") {
            Some((LockKind::CollectionCreate, None))
        } else if name.ends_with(".arrlock") {
            Some((LockKind::CreateArray, extract_tagged_pid(&name)))
        } else if name.ends_with("arrayreadlock") {
            Some((LockKind::ReadArray, extract_tagged_pid(&name)))
        } else if name.ends_with(".varraylock") {
            Some((LockKind::WriteVArray, varraylock_pid(&name)))
        } else {
            None
        };
        if let Some((kind, pid)) = descriptor {
            if kind_filter.map_or(true, |f| f == kind) {
                found.push(LockDescriptor {
                    path: entry.path().to_path_buf(),
                    kind,
                    pid,
                });
            }
        }
    }
    Ok(found)
}

fn extract_tagged_pid(name: &str) -> Option<u32> {
    // tag format: "<prefix>:<uuid>:<pid>:<tid>.<ext>"
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    stem.split(':').nth(2)?.parse().ok()
}

/// Remove every lock file under `root` that this process does not itself
/// hold, attempting a non-blocking exclusive flock on each candidate file
/// as the staleness test: if it succeeds, nothing else has it locked, so
/// it is removed; if it fails, it is left alone. The permanent
/// `<name>.lock` collection sentinel is never a candidate here -- it is
/// unlocked between collection-create calls by design (see
/// [`CollectionCreateGuard`]), and the integrity checker's `Collections`
/// level requires it to persist regardless of lock state.
///
/// # Errors
/// Returns [`Error::Io`] on an unexpected I/O failure.
pub fn clear_stale_locks(root: &Path) -> Result<usize> {
    let mut removed = 0;
    for descriptor in scan_locks(root, None)? {
        if descriptor.kind == LockKind::CollectionCreate {
            continue;
        }
        let file = match OpenOptions::new().write(true).open(&descriptor.path) {
            Ok(f) => f,
            Err(_) => continue,
        };
        if try_lock(&file, libc::LOCK_EX).unwrap_or(false) {
            unlock(&file);
            drop(file);
            if fs::remove_file(&descriptor.path).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::builder()
            .write_lock_timeout(std::time::Duration::from_millis(200))
            .write_lock_check_interval(std::time::Duration::from_millis(10))
            .build()
            .unwrap()
    }

    #[test]
    fn collection_create_guard_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config();
        {
            let _guard = CollectionCreateGuard::acquire(dir.path(), "weather", &cfg).unwrap();
        }
        assert!(dir.path().join("weather.lock").exists());
    }

    #[test]
    fn write_array_guard_conflicts_with_read_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("a.gv");
        fs::write(&payload, b"data").unwrap();
        let cfg = config();
        let _reader = ReadArrayGuard::acquire(&payload).unwrap();
        let err = WriteArrayGuard::acquire(&payload, &cfg).unwrap_err();
        assert!(matches!(err, Error::Locked(_)));
    }

    #[test]
    fn clear_stale_locks_never_removes_the_collection_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config();
        {
            let _guard = CollectionCreateGuard::acquire(dir.path(), "weather", &cfg).unwrap();
        }
        // The guard above has already been dropped (and thus unlocked), so
        // a naive staleness test would treat the sentinel as removable.
        let removed = clear_stale_locks(dir.path()).unwrap();
        assert_eq!(removed, 0);
        assert!(dir.path().join("weather.lock").exists());
    }

    #[test]
    fn same_pid_varraylock_elides_relock() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("t.gv");
        fs::write(&payload, b"data").unwrap();
        let cfg = config();
        let guard1 = WriteVArrayGuard::acquire(&[payload.clone()], &cfg).unwrap();
        // A second acquisition from the same process on the same tile elides
        // re-locking rather than deadlocking against its own flock.
        let guard2 = WriteVArrayGuard::acquire(&[payload.clone()], &cfg).unwrap();
        drop(guard2);
        drop(guard1);
    }
}

//! Per-table run serialisation with file leases.
//!
//! The engine itself never locks. [`SerializedPipeline`] wraps it for callers
//! that may run the same table from several processes: each run holds
//! `{root}/locks/{table}.lock` for its whole duration.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use labourlake_core::PipelineConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{PipelineEngine, PipelineRunResult};
use crate::error::{PipelineError, Result};
use crate::layer::validate_table_name;
use crate::transform::{SchemaDirective, TransformOp};

/// Contents of a lease file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub table: String,
    pub owner_id: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn describe(&self) -> String {
        format!(
            "{} (pid {}) until {}",
            self.owner_id,
            self.pid,
            self.expires_at.to_rfc3339()
        )
    }
}

/// Hands out exclusive leases on table names.
#[derive(Debug, Clone)]
pub struct TableLockManager {
    locks_dir: PathBuf,
    lease: Duration,
    wait: Duration,
    poll: Duration,
}

/// A held lease; released on drop.
#[derive(Debug)]
pub struct TableLease {
    path: PathBuf,
    record: LeaseRecord,
    released: bool,
}

enum Holder {
    Live(LeaseRecord),
    Stale(Option<LeaseRecord>),
    Gone,
}

impl TableLockManager {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            locks_dir: config.locks_dir(),
            lease: Duration::from_secs(config.lock_lease_secs),
            wait: Duration::from_millis(config.lock_wait_ms),
            poll: Duration::from_millis(config.lock_poll_ms.max(1)),
        }
    }

    pub fn lock_path(&self, table: &str) -> PathBuf {
        self.locks_dir.join(format!("{table}.lock"))
    }

    /// Current lease on `table`, if any file is present and readable.
    pub fn holder(&self, table: &str) -> Option<LeaseRecord> {
        let raw = std::fs::read_to_string(self.lock_path(table)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn inspect(&self, path: &Path) -> Result<Holder> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Holder::Gone),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<LeaseRecord>(&raw) {
            Ok(record) if record.is_expired() => Ok(Holder::Stale(Some(record))),
            Ok(record) => Ok(Holder::Live(record)),
            Err(_) => {
                // A writer may still be filling the file; only give up on it
                // once it is older than a full lease.
                let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Holder::Gone),
                    Err(e) => return Err(e.into()),
                };
                let age = modified.elapsed().unwrap_or_default();
                if age >= self.lease {
                    Ok(Holder::Stale(None))
                } else {
                    Ok(Holder::Live(LeaseRecord {
                        table: String::new(),
                        owner_id: "unknown".to_string(),
                        pid: 0,
                        acquired_at: Utc::now(),
                        expires_at: Utc::now(),
                    }))
                }
            }
        }
    }

    fn try_create(&self, table: &str, path: &Path) -> Result<Option<TableLease>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX);
        let record = LeaseRecord {
            table: table.to_string(),
            owner_id: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let body = serde_json::to_vec_pretty(&record)?;
        if let Err(e) = file.write_all(&body).and_then(|()| file.sync_all()) {
            let _ = std::fs::remove_file(path);
            return Err(e.into());
        }
        Ok(Some(TableLease {
            path: path.to_path_buf(),
            record,
            released: false,
        }))
    }

    /// Remove the lease at `path` if it is still the stale lease `seen`.
    ///
    /// The file is first renamed to a private tombstone and re-read there. A
    /// lease that changed since inspection is linked back into place rather
    /// than deleted. Returns whether the stale lease was removed.
    fn take_over(&self, table: &str, path: &Path, seen: Option<&LeaseRecord>) -> Result<bool> {
        let tombstone = self
            .locks_dir
            .join(format!(".{table}.lock.{}.stale", Uuid::new_v4()));
        match std::fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let unchanged = match (seen, self.inspect(&tombstone)?) {
            (Some(seen), Holder::Stale(Some(current))) => current == *seen,
            (None, Holder::Stale(None)) => true,
            _ => false,
        };
        if !unchanged {
            match std::fs::hard_link(&tombstone, path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tracing::warn!(table, "Table lease was replaced while being restored");
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&tombstone);
                    return Err(e.into());
                }
            }
        }
        std::fs::remove_file(&tombstone)?;
        Ok(unchanged)
    }

    /// Take the lease on `table`, waiting up to the configured time.
    ///
    /// Expired leases are taken over. Fails with
    /// [`PipelineError::TableLocked`] when a live lease outlasts the wait.
    pub fn acquire(&self, table: &str) -> Result<TableLease> {
        validate_table_name(table)?;
        std::fs::create_dir_all(&self.locks_dir)?;
        let path = self.lock_path(table);
        let deadline = Instant::now() + self.wait;
        loop {
            if let Some(lease) = self.try_create(table, &path)? {
                tracing::debug!(table, owner = %lease.record.owner_id, "Acquired table lease");
                return Ok(lease);
            }
            match self.inspect(&path)? {
                Holder::Gone => continue,
                Holder::Stale(previous) => {
                    if self.take_over(table, &path, previous.as_ref())? {
                        tracing::warn!(
                            table,
                            previous = previous.as_ref().map(|r| r.owner_id.as_str()).unwrap_or("unreadable"),
                            "Took over expired table lease"
                        );
                    }
                }
                Holder::Live(record) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PipelineError::TableLocked {
                            table: table.to_string(),
                            holder: record.describe(),
                        });
                    }
                    std::thread::sleep(self.poll.min(deadline - now));
                }
            }
        }
    }
}

impl TableLease {
    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now, reporting any error. Dropping releases silently.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> Result<()> {
        let current = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<LeaseRecord>(&raw).ok());
        if current.is_some_and(|r| r.owner_id == self.record.owner_id) {
            std::fs::remove_file(&self.path)?;
            tracing::debug!(table = %self.record.table, "Released table lease");
        }
        Ok(())
    }
}

impl Drop for TableLease {
    fn drop(&mut self) {
        if !self.released
            && let Err(error) = self.remove_if_owned()
        {
            tracing::warn!(table = %self.record.table, %error, "Could not release table lease");
        }
    }
}

/// [`PipelineEngine`] whose full runs are serialised per table.
#[derive(Debug, Clone)]
pub struct SerializedPipeline {
    engine: PipelineEngine,
    locks: TableLockManager,
}

impl SerializedPipeline {
    pub fn new(engine: PipelineEngine) -> Self {
        let locks = TableLockManager::new(engine.config());
        Self { engine, locks }
    }

    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    pub fn locks(&self) -> &TableLockManager {
        &self.locks
    }

    /// [`PipelineEngine::run_full_pipeline`] under the table's lease.
    pub fn run_full_pipeline(
        &self,
        source_path: &Path,
        table_name: &str,
        domain: &str,
        bronze_schema: Option<&SchemaDirective>,
        silver_transforms: &[TransformOp],
        gold_transforms: &[TransformOp],
    ) -> Result<PipelineRunResult> {
        let lease = self.locks.acquire(table_name)?;
        let result = self.engine.run_full_pipeline(
            source_path,
            table_name,
            domain,
            bronze_schema,
            silver_transforms,
            gold_transforms,
        );
        if let Err(error) = lease.release() {
            tracing::warn!(table = table_name, %error, "Could not release table lease");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, lease_secs: u64, wait_ms: u64) -> TableLockManager {
        let mut config = PipelineConfig::new(dir.path());
        config.lock_lease_secs = lease_secs;
        config.lock_wait_ms = wait_ms;
        config.lock_poll_ms = 10;
        TableLockManager::new(&config)
    }

    #[test]
    fn test_acquire_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, 60, 0);
        let lease = locks.acquire("noc").unwrap();
        assert!(lease.path().exists());
        assert_eq!(locks.holder("noc").unwrap(), *lease.record());
        lease.release().unwrap();
        assert!(!locks.lock_path("noc").exists());
    }

    #[test]
    fn test_contention_times_out() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, 60, 50);
        let _held = locks.acquire("noc").unwrap();
        let err = locks.acquire("noc").unwrap_err();
        assert!(matches!(err, PipelineError::TableLocked { ref table, .. } if table == "noc"));
        assert!(locks.acquire("oasis").is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, 60, 0);
        {
            let _lease = locks.acquire("noc").unwrap();
        }
        assert!(locks.acquire("noc").is_ok());
    }

    #[test]
    fn test_expired_lease_taken_over() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, 0, 0);
        let first = locks.acquire("noc").unwrap();
        let second = locks.acquire("noc").unwrap();
        assert_ne!(first.record().owner_id, second.record().owner_id);
        // The takeover belongs to the second holder now.
        drop(first);
        assert!(locks.lock_path("noc").exists());
        drop(second);
        assert!(!locks.lock_path("noc").exists());
    }

    fn record(owner: &str, expires_in_secs: i64) -> LeaseRecord {
        let now = Utc::now();
        LeaseRecord {
            table: "noc".to_string(),
            owner_id: owner.to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(expires_in_secs),
        }
    }

    fn tombstones(locks: &TableLockManager) -> Vec<String> {
        std::fs::read_dir(&locks.locks_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".stale"))
            .collect()
    }

    #[test]
    fn test_takeover_spares_lease_replaced_after_inspection() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, 60, 0);
        std::fs::create_dir_all(&locks.locks_dir).unwrap();
        let path = locks.lock_path("noc");
        let expired = record("expired-owner", -5);
        let fresh = record("fresh-owner", 60);

        std::fs::write(&path, serde_json::to_vec(&fresh).unwrap()).unwrap();
        assert!(!locks.take_over("noc", &path, Some(&expired)).unwrap());
        assert_eq!(locks.holder("noc").unwrap(), fresh);
        assert!(tombstones(&locks).is_empty());

        std::fs::write(&path, serde_json::to_vec(&expired).unwrap()).unwrap();
        assert!(locks.take_over("noc", &path, Some(&expired)).unwrap());
        assert!(!path.exists());
        assert!(tombstones(&locks).is_empty());
    }

    #[test]
    fn test_racing_takeovers_of_instantly_stale_leases() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, 0, 0);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                std::thread::spawn(move || {
                    let mut owners = Vec::new();
                    for _ in 0..25 {
                        let lease = locks.acquire("noc").map_err(|e| e.to_string())?;
                        owners.push(lease.record().owner_id.clone());
                    }
                    Ok::<_, String>(owners)
                })
            })
            .collect();
        let mut owners = Vec::new();
        for worker in workers {
            owners.extend(worker.join().unwrap().unwrap());
        }
        let total = owners.len();
        owners.sort();
        owners.dedup();
        assert_eq!(owners.len(), total);
        assert_eq!(total, 8 * 25);
        assert!(tombstones(&locks).is_empty());
    }

    #[test]
    fn test_waiter_gets_lease_after_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, 60, 5_000);
        let held = locks.acquire("noc").unwrap();
        let waiter = {
            let locks = locks.clone();
            std::thread::spawn(move || locks.acquire("noc").map(|l| l.record().owner_id.clone()))
        };
        std::thread::sleep(Duration::from_millis(50));
        let first_owner = held.record().owner_id.clone();
        held.release().unwrap();
        let second_owner = waiter.join().unwrap().unwrap();
        assert_ne!(first_owner, second_owner);
    }
}

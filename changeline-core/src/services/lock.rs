//! Lock service - cluster-wide migration lock
//!
//! The lock is a single row in the lock table, taken with an atomic
//! insert-if-absent. Whoever inserted the row owns the lock until it is
//! deleted. A crashed process leaves its row behind; clearing it is an
//! operator decision (`force_release`), never automatic.

use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::domain::result::{Error, Result};
use crate::domain::{LockRecord, LOCK_TABLE};
use crate::ports::Database;

/// Name of this machine, for lock holders and log messages
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Identifier written into the lock row: `host:pid:uuid`
fn holder_id() -> String {
    let unique = Uuid::new_v4().simple().to_string();
    format!("{}:{}:{}", hostname(), std::process::id(), &unique[..8])
}

pub struct LockManager {
    holder: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            holder: holder_id(),
            timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Take the lock, waiting up to the configured timeout
    ///
    /// The returned guard dereferences to the database, so all work done
    /// under the lock goes through it.
    pub fn acquire<'a>(&self, db: &'a mut dyn Database) -> Result<LockGuard<'a>> {
        ensure_lock_table(db)?;

        let started = Instant::now();
        let mut announced = false;
        loop {
            if db.try_insert_lock(&self.holder)? {
                log::info!("Acquired migration lock as {}", self.holder);
                return Ok(LockGuard {
                    db,
                    holder: self.holder.clone(),
                    released: false,
                });
            }

            let waited = started.elapsed();
            let current = db.read_lock()?;
            if waited >= self.timeout {
                return Err(Error::LockTimeout {
                    holder: current
                        .map(|r| r.locked_by)
                        .unwrap_or_else(|| "unknown".to_string()),
                    waited,
                });
            }

            if !announced {
                if let Some(record) = &current {
                    log::info!(
                        "Waiting for migration lock held by {} since {}",
                        record.locked_by,
                        record.locked_at
                    );
                }
                announced = true;
            }
            thread::sleep(self.poll_interval.min(self.timeout - waited));
        }
    }

    /// Current lock row, if any
    pub fn current(db: &mut dyn Database) -> Result<Option<LockRecord>> {
        db.read_lock()
    }

    /// Delete the lock row whoever holds it
    pub fn force_release(db: &mut dyn Database) -> Result<bool> {
        let holder = db.read_lock()?.map(|r| r.locked_by);
        let released = db.delete_lock(None)?;
        if let Some(holder) = holder.filter(|_| released) {
            log::warn!("Forcibly released migration lock held by {}", holder);
        }
        Ok(released)
    }
}

/// Creating the table can race with another process doing the same
fn ensure_lock_table(db: &mut dyn Database) -> Result<()> {
    match db.ensure_lock_table() {
        Ok(()) => Ok(()),
        Err(e) => {
            if db.table_exists(None, LOCK_TABLE)? {
                log::debug!("Lock table created concurrently: {}", e);
                Ok(())
            } else {
                db.ensure_lock_table()
            }
        }
    }
}

/// Held migration lock; released on drop if not released explicitly
pub struct LockGuard<'a> {
    db: &'a mut dyn Database,
    holder: String,
    released: bool,
}

impl LockGuard<'_> {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release the lock, reporting failures
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        if !self.db.delete_lock(Some(&self.holder))? {
            log::warn!(
                "Migration lock for {} was already gone on release (force-released?)",
                self.holder
            );
        } else {
            log::info!("Released migration lock");
        }
        Ok(())
    }
}

impl<'a> Deref for LockGuard<'a> {
    type Target = dyn Database + 'a;

    fn deref(&self) -> &Self::Target {
        self.db
    }
}

impl<'a> DerefMut for LockGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.db
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.db.delete_lock(Some(&self.holder)) {
            log::error!("Failed to release migration lock {}: {}", self.holder, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DuckDbDatabase;

    fn manager(timeout_ms: u64) -> LockManager {
        LockManager::new(Duration::from_millis(timeout_ms), Duration::from_millis(10))
    }

    #[test]
    fn test_acquire_and_release() {
        let mut db = DuckDbDatabase::open_in_memory().unwrap();
        let lock = manager(100);

        let guard = lock.acquire(&mut db).unwrap();
        assert_eq!(guard.holder(), lock.holder());
        guard.release().unwrap();

        assert!(LockManager::current(&mut db).unwrap().is_none());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let mut db = DuckDbDatabase::open_in_memory().unwrap();
        let lock = manager(100);
        {
            let mut guard = lock.acquire(&mut db).unwrap();
            guard.execute("SELECT 1").unwrap();
        }
        assert!(LockManager::current(&mut db).unwrap().is_none());
    }

    #[test]
    fn test_timeout_names_holder_and_leaves_row() {
        let mut db = DuckDbDatabase::open_in_memory().unwrap();
        db.ensure_lock_table().unwrap();
        assert!(db.try_insert_lock("other-host:1:abc").unwrap());

        let err = manager(50).acquire(&mut db).err().unwrap();
        match err {
            Error::LockTimeout { holder, waited } => {
                assert_eq!(holder, "other-host:1:abc");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("unexpected error {:?}", other),
        }

        // Stale locks are never cleared automatically
        assert_eq!(
            LockManager::current(&mut db).unwrap().unwrap().locked_by,
            "other-host:1:abc"
        );
        assert!(LockManager::force_release(&mut db).unwrap());
        assert!(manager(50).acquire(&mut db).is_ok());
    }

    #[test]
    fn test_holder_id_format() {
        let id = holder_id();
        assert_eq!(id.split(':').count(), 3);
    }
}

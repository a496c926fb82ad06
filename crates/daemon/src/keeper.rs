use chrono::{DateTime, Utc};
use common::{LeaseConfig, LeaseError, LeaseSnapshot, LeaseState, TerminationReason};
use rusqlite::Connection;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::db;

#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error("failed to persist lease: {0}")]
    Persist(#[from] rusqlite::Error),
}

struct Inner {
    lease: LeaseState,
    conn: Connection,
}

/// Single owner of the instance's `LeaseState`.
///
/// The lease and its database connection sit behind one mutex, so every
/// decision is made on a consistent view. An extension is checked, written
/// to disk and applied without the lock ever being released in between.
pub struct LeaseKeeper {
    inner: Mutex<Inner>,
}

impl LeaseKeeper {
    /// Resume the stored lease for `instance_id`, or start a new one at `now`.
    pub fn open(
        conn: Connection,
        instance_id: &str,
        config: &LeaseConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, rusqlite::Error> {
        let lease = match db::load_lease(&conn, instance_id)? {
            Some(stored) => {
                info!(
                    "Resuming lease for {} (created {}, deadline {}, {} extension(s))",
                    stored.instance_id, stored.created_at, stored.lease_deadline, stored.extension_count
                );
                if stored.max_lease_hours != config.max_lease_hours {
                    warn!(
                        "Stored maximum of {}h kept; configured {}h ignored",
                        stored.max_lease_hours, config.max_lease_hours
                    );
                }
                stored
            }
            None => {
                let lease = LeaseState::new(instance_id, now, config);
                db::save_lease(&conn, &lease)?;
                info!(
                    "Started lease for {}: deadline {}, hard limit {}",
                    lease.instance_id,
                    lease.lease_deadline,
                    lease.hard_deadline()
                );
                lease
            }
        };
        Ok(Self {
            inner: Mutex::new(Inner { lease, conn }),
        })
    }

    pub fn instance_id(&self) -> String {
        self.inner.lock().unwrap().lease.instance_id.clone()
    }

    pub fn lease(&self) -> LeaseState {
        self.inner.lock().unwrap().lease.clone()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> LeaseSnapshot {
        self.inner.lock().unwrap().lease.snapshot(now)
    }

    /// Decide and commit under one lock, so an extension cannot land between
    /// the expiry check and the move to `SHUTTING_DOWN`.
    ///
    /// A termination already committed is returned as is. Otherwise the lease
    /// is evaluated at `now` and, if a trigger fired, committed with it.
    /// Returns the reason in force and whether this call made the transition.
    pub fn evaluate_and_commit(&self, now: DateTime<Utc>) -> Option<(TerminationReason, bool)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.lease.termination_reason {
            return Some((reason, false));
        }
        let reason = inner.lease.evaluate(now)?;
        Some(Self::commit(&mut inner, reason))
    }

    pub fn pending_shutdown(&self) -> Option<TerminationReason> {
        self.inner.lock().unwrap().lease.termination_reason
    }

    /// Check the ceiling, persist, then apply, all in one critical section.
    pub fn extend(&self, hours: i64) -> Result<LeaseState, KeeperError> {
        let mut inner = self.inner.lock().unwrap();
        let mut candidate = inner.lease.clone();
        candidate.extend(hours)?;
        db::save_lease(&inner.conn, &candidate)?;
        inner.lease = candidate;
        Ok(inner.lease.clone())
    }

    /// Reset the idle clock. Refused once the instance is shutting down.
    pub fn record_activity(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>, LeaseError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lease.is_shutting_down() {
            return Err(LeaseError::ShuttingDown);
        }
        inner.lease.record_activity(at);
        let last = inner.lease.last_activity_at;
        if let Err(e) = db::update_activity(&inner.conn, &inner.lease.instance_id, last) {
            warn!("Failed to persist activity timestamp: {}", e);
        }
        Ok(last)
    }

    /// Move to `SHUTTING_DOWN`. Returns the reason now in force and whether
    /// this call made the transition.
    pub fn begin_shutdown(&self, reason: TerminationReason) -> (TerminationReason, bool) {
        let mut inner = self.inner.lock().unwrap();
        Self::commit(&mut inner, reason)
    }

    fn commit(inner: &mut Inner, reason: TerminationReason) -> (TerminationReason, bool) {
        let first = inner.lease.begin_shutdown(reason);
        if first {
            if let Err(e) = db::save_lease(&inner.conn, &inner.lease) {
                warn!("Failed to persist termination reason: {}", e);
            }
        }
        let committed = inner.lease.termination_reason.unwrap_or(reason);
        (committed, first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn config() -> LeaseConfig {
        LeaseConfig {
            initial_lease_hours: 1,
            max_lease_hours: 8,
            idle_timeout_minutes: 30,
        }
    }

    #[test]
    fn reopening_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.db");
        let t0 = Utc::now() - Duration::hours(3);

        let keeper = LeaseKeeper::open(db::init_db(&path).unwrap(), "i-1", &config(), t0).unwrap();
        keeper.extend(2).unwrap();
        drop(keeper);

        let reopened =
            LeaseKeeper::open(db::init_db(&path).unwrap(), "i-1", &config(), Utc::now()).unwrap();
        let lease = reopened.lease();
        assert_eq!(lease.created_at, t0);
        assert_eq!(lease.lease_deadline, t0 + Duration::hours(3));
        assert_eq!(lease.extension_count, 1);
    }

    #[test]
    fn concurrent_extensions_never_cross_ceiling() {
        let t0 = Utc::now();
        let keeper = Arc::new(
            LeaseKeeper::open(db::init_in_memory().unwrap(), "i-1", &config(), t0).unwrap(),
        );

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let keeper = keeper.clone();
                std::thread::spawn(move || keeper.extend(2).is_ok())
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        // 1h initial + 3 x 2h = 7h; a fourth would reach 9h.
        assert_eq!(accepted, 3);
        let lease = keeper.lease();
        assert_eq!(lease.lease_deadline, t0 + Duration::hours(7));
        assert!(lease.lease_deadline <= lease.hard_deadline());
    }

    #[test]
    fn expiry_commit_blocks_late_extension() {
        let t0 = Utc::now();
        let keeper = LeaseKeeper::open(db::init_in_memory().unwrap(), "i-1", &config(), t0).unwrap();
        let now = t0 + Duration::minutes(61);

        assert_eq!(
            keeper.evaluate_and_commit(now),
            Some((TerminationReason::LeaseExpired, true))
        );
        assert!(matches!(
            keeper.extend(2),
            Err(KeeperError::Lease(LeaseError::ShuttingDown))
        ));
        assert_eq!(keeper.lease().lease_deadline, t0 + Duration::hours(1));
        // Already committed: reported again, not re-committed.
        assert_eq!(
            keeper.evaluate_and_commit(now),
            Some((TerminationReason::LeaseExpired, false))
        );
    }

    #[test]
    fn extension_before_expiry_check_wins() {
        let t0 = Utc::now();
        let keeper = LeaseKeeper::open(db::init_in_memory().unwrap(), "i-1", &config(), t0).unwrap();
        let now = t0 + Duration::minutes(61);

        keeper.record_activity(now).unwrap();
        keeper.extend(2).unwrap();
        assert_eq!(keeper.evaluate_and_commit(now), None);
        assert_eq!(keeper.pending_shutdown(), None);
    }

    #[test]
    fn extension_racing_expiry_is_exclusive() {
        for _ in 0..200 {
            let t0 = Utc::now();
            let keeper = Arc::new(
                LeaseKeeper::open(db::init_in_memory().unwrap(), "i-1", &config(), t0).unwrap(),
            );
            let now = t0 + Duration::minutes(61);
            keeper.record_activity(now).unwrap();

            let extender = {
                let keeper = keeper.clone();
                std::thread::spawn(move || keeper.extend(2).is_ok())
            };
            let committed = keeper.evaluate_and_commit(now).is_some();
            let extended = extender.join().unwrap();

            // Exactly one side wins, and a committed shutdown never sees a
            // deadline pushed past the moment it decided on.
            assert_ne!(committed, extended);
            if committed {
                assert_eq!(keeper.lease().lease_deadline, t0 + Duration::hours(1));
            }
        }
    }

    #[test]
    fn shutdown_blocks_mutations() {
        let keeper = LeaseKeeper::open(db::init_in_memory().unwrap(), "i-1", &config(), Utc::now()).unwrap();
        assert_eq!(
            keeper.begin_shutdown(TerminationReason::Manual),
            (TerminationReason::Manual, true)
        );
        assert_eq!(
            keeper.begin_shutdown(TerminationReason::IdleTimeout),
            (TerminationReason::Manual, false)
        );
        assert!(matches!(
            keeper.extend(1),
            Err(KeeperError::Lease(LeaseError::ShuttingDown))
        ));
        assert_eq!(
            keeper.record_activity(Utc::now()),
            Err(LeaseError::ShuttingDown)
        );
    }
}

//! The ledger handle and its atomic units.
//!
//! Every mutation runs inside [`Ledger::atomically`]: one `BEGIN IMMEDIATE`
//! SQLite transaction, which holds the database write lock (across processes)
//! until commit. Returning an error from the closure rolls everything back.
//! Notifications queued during the unit are delivered only after commit.

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::approval::PendingQueueCache;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::gateway::{LogNotifier, Notification, NotificationEvent, NotificationSink};
use crate::model::Member;
use crate::store;
use crate::types::{Clock, MemberId, SystemClock, Timestamp};

/// How long a writer waits for another process to release the database
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The credit and capital ledger
pub struct Ledger {
    conn: Mutex<Connection>,
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationSink>,
    pub(crate) pending_cache: PendingQueueCache,
}

impl Ledger {
    /// Open or create a ledger database file
    pub fn open(path: &Path, config: LedgerConfig) -> LedgerResult<Self> {
        config.validate()?;
        info!("Opening ledger database at {:?}", path);

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )?;

        Self::from_connection(conn, config)
    }

    /// Open an in-memory ledger (for testing)
    pub fn open_in_memory(config: LedgerConfig) -> LedgerResult<Self> {
        config.validate()?;
        debug!("Opening in-memory ledger database");

        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        Self::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: LedgerConfig) -> LedgerResult<Self> {
        store::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
            pending_cache: PendingQueueCache::default(),
        })
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the notification sink
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Run `f` as one atomic unit; any error rolls back every write it made
    pub fn atomically<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut Session<'_>) -> LedgerResult<T>,
    {
        let (value, outbox) = {
            let mut conn = self.lock_conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut session = Session {
                tx,
                config: &self.config,
                now: self.clock.now(),
                outbox: Vec::new(),
                pending_changed: false,
            };

            let value = f(&mut session)?;

            if session.pending_changed {
                store::bump_pending_generation(&session.tx)?;
            }
            let Session { tx, outbox, .. } = session;
            tx.commit()?;
            (value, outbox)
        };

        self.deliver(outbox);
        Ok(value)
    }

    /// Run a read-only query against a consistent snapshot
    pub fn read<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Connection) -> LedgerResult<T>,
    {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx)?;
        tx.finish()?;
        Ok(value)
    }

    fn lock_conn(&self) -> LedgerResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn deliver(&self, outbox: Vec<Notification>) {
        for notification in outbox {
            if let Err(e) = self.notifier.notify(&notification) {
                warn!(
                    member = %notification.member_id,
                    event = %notification.event,
                    "Failed to deliver notification: {}", e
                );
            }
        }
    }

    /// Fail unless `member` exists and is an administrator
    pub(crate) fn require_admin(conn: &Connection, member: &MemberId) -> LedgerResult<Member> {
        let member = store::get_member(conn, member)?;
        if !member.is_admin {
            return Err(LedgerError::PermissionDenied(format!(
                "Member {} is not an administrator",
                member.id
            )));
        }
        Ok(member)
    }
}

/// One open atomic unit of ledger work
pub struct Session<'a> {
    tx: rusqlite::Transaction<'a>,
    config: &'a LedgerConfig,
    now: Timestamp,
    outbox: Vec<Notification>,
    pending_changed: bool,
}

impl<'a> Session<'a> {
    /// The connection of this unit; reads see uncommitted writes of the unit
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    pub fn config(&self) -> &LedgerConfig {
        self.config
    }

    /// The time the unit started; every timestamp written by the unit uses it
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Queue a notification for delivery after commit
    pub fn notify<P: Serialize>(
        &mut self,
        member_id: &MemberId,
        event: NotificationEvent,
        payload: P,
    ) {
        let payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        self.outbox.push(Notification {
            member_id: member_id.clone(),
            event,
            payload,
        });
    }

    /// Invalidate the pending approval queue once this unit commits
    pub fn invalidate_pending_queue(&mut self) {
        self.pending_changed = true;
    }

    pub(crate) fn require_admin(&self, member: &MemberId) -> LedgerResult<Member> {
        Ledger::require_admin(self.conn(), member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::{Channel, ChargeBreakdown};
    use crate::model::TransactionDetails;
    use crate::types::Amount;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: StdMutex<Vec<Notification>>,
    }

    impl NotificationSink for RecordingNotifier {
        fn notify(&self, notification: &Notification) -> Result<(), crate::gateway::NotifyError> {
            self.seen.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    #[test]
    fn test_failed_unit_rolls_back() {
        let ledger = Ledger::open_in_memory(LedgerConfig::default()).unwrap();
        let member = ledger.register_member("Ana", false).unwrap();

        let result: LedgerResult<()> = ledger.atomically(|s| {
            let charge = ChargeBreakdown {
                channel: Channel::Balance,
                base: Amount::new(1_000),
                fee: Amount::zero(),
                total: Amount::new(1_000),
            };
            s.credit(&member.id, Amount::new(1_000), TransactionDetails::Deposit { charge })?;
            Err(LedgerError::Validation("abort".to_string()))
        });
        assert!(result.is_err());

        let member = ledger.member(&member.id).unwrap();
        assert_eq!(member.balance, Amount::zero());
        assert!(ledger.transactions_for(&member.id).unwrap().is_empty());
    }

    #[test]
    fn test_notifications_only_after_commit() {
        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = Ledger::open_in_memory(LedgerConfig::default())
            .unwrap()
            .with_notifier(notifier.clone());
        let member = ledger.register_member("Ana", false).unwrap();

        let _ = ledger.atomically(|s| -> LedgerResult<()> {
            s.notify(&member.id, NotificationEvent::QuotaPurchased, "rolled back");
            Err(LedgerError::Validation("abort".to_string()))
        });
        assert!(notifier.seen.lock().unwrap().is_empty());

        ledger
            .atomically(|s| {
                s.notify(&member.id, NotificationEvent::QuotaPurchased, "committed");
                Ok(())
            })
            .unwrap();
        assert_eq!(notifier.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_file_backed_ledger_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        let member_id = {
            let ledger = Ledger::open(&path, LedgerConfig::default()).unwrap();
            ledger.register_member("Ana", true).unwrap().id
        };

        let ledger = Ledger::open(&path, LedgerConfig::default()).unwrap();
        let member = ledger.member(&member_id).unwrap();
        assert!(member.is_admin);
    }
}

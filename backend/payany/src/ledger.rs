//! Rolling-window spend accounting.
//!
//! The ledger answers one question: would paying `candidate` push the spend
//! of the last `window` seconds above the cap? Checking and reserving happen
//! under a single lock, and outstanding reservations count towards the total,
//! so concurrent payments cannot jointly overshoot. A reservation only turns
//! into a ledger entry once the payment is known to have succeeded.
//!
//! Expiry is lazy: entries are filtered by timestamp at every check and
//! dropped once they are older than both the window and [`RETENTION_SECS`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{PayanyError, Result};

/// Entries are kept at least this long so that widening the window later
/// still sees recent spend.
pub const RETENTION_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetConfig {
    pub window_secs: u64,
    pub cap_msat: u64,
}

impl BudgetConfig {
    pub fn new(window_secs: u64, cap_msat: u64) -> Result<Self> {
        if window_secs == 0 {
            return Err(PayanyError::Config(
                "budget period must be longer than 0 seconds".to_string(),
            ));
        }
        Ok(BudgetConfig {
            window_secs,
            cap_msat,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub timestamp: i64,
    pub amount_msat: u64,
}

/// Snapshot returned by [`BudgetLedger::usage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_per_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_amount_msat: Option<u64>,
    pub spent_msat: u64,
    pub reserved_msat: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_msat: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Reserved,
    Finalized,
    Released,
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Default)]
struct LedgerInner {
    config: Option<BudgetConfig>,
    entries: VecDeque<LedgerEntry>,
    reserved: HashMap<u64, u64>,
    next_id: u64,
}

impl LedgerInner {
    /// Oldest timestamp still kept: the larger of the window and
    /// [`RETENTION_SECS`] before `now`.
    fn horizon(&self, now: i64) -> i64 {
        let keep = self
            .config
            .map(|c| c.window_secs.max(RETENTION_SECS))
            .unwrap_or(RETENTION_SECS);
        now.saturating_sub(keep as i64)
    }

    fn prune(&mut self, now: i64) {
        let horizon = self.horizon(now);
        while self.entries.front().is_some_and(|e| e.timestamp < horizon) {
            self.entries.pop_front();
        }
    }

    /// Committed spend inside the window ending at `now`. Entries stamped in
    /// the future still count.
    fn spent_in_window(&self, now: i64, window_secs: u64) -> u64 {
        let cutoff = now.saturating_sub(window_secs as i64);
        self.entries
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .fold(0u64, |acc, e| acc.saturating_add(e.amount_msat))
    }

    fn reserved_total(&self) -> u64 {
        self.reserved
            .values()
            .fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    fn push(&mut self, entry: LedgerEntry) {
        // Keep the deque ordered so pruning from the front stays correct.
        let pos = self
            .entries
            .iter()
            .rposition(|e| e.timestamp <= entry.timestamp)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.entries.insert(pos, entry);
    }
}

fn budget_summary(config: Option<BudgetConfig>) -> String {
    match config {
        Some(c) => format!("Budget set to {}msat every {}seconds", c.cap_msat, c.window_secs),
        None => "No Budget set!".to_string(),
    }
}

fn log_budget(config: Option<BudgetConfig>) {
    info!("{}", budget_summary(config));
}

/// Shared handle to the process-wide ledger. Clones refer to the same state.
#[derive(Clone)]
pub struct BudgetLedger {
    inner: Arc<Mutex<LedgerInner>>,
    clock: Clock,
}

impl BudgetLedger {
    /// Create a ledger on the system clock. The budget in force is logged.
    pub fn new(config: Option<BudgetConfig>) -> Self {
        Self::with_clock(config, || Utc::now().timestamp())
    }

    /// Create a ledger with a custom timestamp source (unix seconds).
    pub fn with_clock<F>(config: Option<BudgetConfig>, clock: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        log_budget(config);
        BudgetLedger {
            inner: Arc::new(Mutex::new(LedgerInner {
                config,
                ..Default::default()
            })),
            clock: Arc::new(clock),
        }
    }

    pub fn now(&self) -> i64 {
        (self.clock)()
    }

    pub fn config(&self) -> Option<BudgetConfig> {
        self.inner.lock().config
    }

    /// Swap the budget. Takes effect for the next check; reservations already
    /// granted stay valid.
    pub fn reconfigure(&self, config: Option<BudgetConfig>) {
        self.inner.lock().config = config;
        log_budget(config);
    }

    /// Check `candidate_msat` against the budget and hold it if it fits.
    pub fn try_reserve(&self, candidate_msat: u64) -> Result<Reservation> {
        let now = self.now();
        let mut inner = self.inner.lock();
        inner.prune(now);

        if let Some(config) = inner.config {
            let projected = inner
                .spent_in_window(now, config.window_secs)
                .saturating_add(inner.reserved_total())
                .saturating_add(candidate_msat);
            if projected > config.cap_msat {
                return Err(PayanyError::BudgetExceeded {
                    projected_msat: projected,
                    cap_msat: config.cap_msat,
                });
            }
            info!(
                "Within budget! {}msat / {}msat",
                projected, config.cap_msat
            );
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.reserved.insert(id, candidate_msat);
        Ok(Reservation {
            id,
            amount_msat: candidate_msat,
            state: ReservationState::Reserved,
            ledger: self.clone(),
        })
    }

    /// Commit the real spend of a successful payment.
    pub fn finalize(&self, reservation: Reservation, actual_msat: u64) -> LedgerEntry {
        reservation.finalize(actual_msat)
    }

    /// Drop a reservation without committing anything.
    pub fn release(&self, reservation: Reservation) {
        reservation.release()
    }

    /// Re-insert persisted entries. Entries past the retention horizon are
    /// skipped; the rest are kept even when outside the current window so a
    /// later, wider window still counts them.
    pub fn restore<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = LedgerEntry>,
    {
        let now = self.now();
        let mut inner = self.inner.lock();
        let horizon = inner.horizon(now);
        let mut restored = 0;
        for entry in entries {
            if entry.timestamp < horizon {
                continue;
            }
            inner.push(entry);
            restored += 1;
        }
        restored
    }

    pub fn usage(&self) -> BudgetUsage {
        let now = self.now();
        let inner = self.inner.lock();
        let reserved_msat = inner.reserved_total();
        match inner.config {
            Some(c) => {
                let spent_msat = inner.spent_in_window(now, c.window_secs);
                BudgetUsage {
                    budget_per_secs: Some(c.window_secs),
                    budget_amount_msat: Some(c.cap_msat),
                    spent_msat,
                    reserved_msat,
                    remaining_msat: Some(
                        c.cap_msat
                            .saturating_sub(spent_msat.saturating_add(reserved_msat)),
                    ),
                }
            }
            None => BudgetUsage {
                budget_per_secs: None,
                budget_amount_msat: None,
                spent_msat: inner.spent_in_window(now, RETENTION_SECS),
                reserved_msat,
                remaining_msat: None,
            },
        }
    }

    fn commit(&self, id: u64, amount_msat: u64) -> LedgerEntry {
        let entry = LedgerEntry {
            timestamp: self.now(),
            amount_msat,
        };
        let mut inner = self.inner.lock();
        inner.reserved.remove(&id);
        inner.push(entry);
        entry
    }

    fn drop_hold(&self, id: u64) {
        self.inner.lock().reserved.remove(&id);
    }
}

/// A budget hold for one in-flight payment.
///
/// Must end in [`Reservation::finalize`] or [`Reservation::release`]; a
/// reservation dropped in the `Reserved` state is released.
#[must_use = "a reservation must be finalized or released"]
pub struct Reservation {
    id: u64,
    amount_msat: u64,
    state: ReservationState,
    ledger: BudgetLedger,
}

impl Reservation {
    pub fn amount_msat(&self) -> u64 {
        self.amount_msat
    }

    pub fn finalize(mut self, actual_msat: u64) -> LedgerEntry {
        self.state = ReservationState::Finalized;
        debug!(
            "Finalizing reservation {} ({}msat reserved, {}msat spent)",
            self.id, self.amount_msat, actual_msat
        );
        self.ledger.commit(self.id, actual_msat)
    }

    pub fn release(mut self) {
        self.state = ReservationState::Released;
        debug!("Releasing reservation {} ({}msat)", self.id, self.amount_msat);
        self.ledger.drop_hold(self.id);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.state == ReservationState::Reserved {
            self.state = ReservationState::Released;
            self.ledger.drop_hold(self.id);
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("amount_msat", &self.amount_msat)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    const HOUR: u64 = 3600;

    fn ledger_at(config: Option<BudgetConfig>, start: i64) -> (BudgetLedger, Arc<AtomicI64>) {
        let now = Arc::new(AtomicI64::new(start));
        let clock = now.clone();
        let ledger = BudgetLedger::with_clock(config, move || clock.load(Ordering::SeqCst));
        (ledger, now)
    }

    fn budget(window_secs: u64, cap_msat: u64) -> Option<BudgetConfig> {
        Some(BudgetConfig::new(window_secs, cap_msat).unwrap())
    }

    #[test]
    fn zero_window_is_rejected() {
        assert!(BudgetConfig::new(0, 1000).is_err());
        assert!(BudgetConfig::new(1, 0).is_ok());
    }

    #[test]
    fn budget_summary_lines() {
        assert_eq!(
            budget_summary(budget(86_400, 1_000_000)),
            "Budget set to 1000000msat every 86400seconds"
        );
        assert_eq!(budget_summary(None), "No Budget set!");
    }

    #[test]
    fn budget_scenario_from_node_test() {
        let (ledger, _) = ledger_at(budget(5 * HOUR, 1_000_000), 1_700_000_000);

        // 950_000 invoice with the default 1% / 5000msat fee cap.
        let first = ledger.try_reserve(959_500).unwrap();
        first.finalize(951_009);
        assert_eq!(ledger.usage().spent_msat, 951_009);

        let err = ledger.try_reserve(959_500).unwrap_err();
        match err {
            PayanyError::BudgetExceeded {
                projected_msat,
                cap_msat,
            } => {
                assert_eq!(projected_msat, 1_910_509);
                assert_eq!(cap_msat, 1_000_000);
            }
            other => panic!("unexpected error: {other}"),
        }

        ledger.reconfigure(budget(5 * HOUR, 2_000_000));
        // maxfeepercent 2 => 19_000msat fee cap.
        let third = ledger.try_reserve(969_000).unwrap();
        third.finalize(951_009);

        let err = ledger.try_reserve(969_000).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Budget would be exceeded! 2871018msat / 2000000msat"
        );
    }

    #[test]
    fn payments_up_to_the_cap_succeed() {
        let (ledger, _) = ledger_at(budget(HOUR, 10_000), 0);
        for _ in 0..4 {
            ledger.try_reserve(2_500).unwrap().finalize(2_500);
        }
        assert_eq!(ledger.usage().remaining_msat, Some(0));
        assert!(matches!(
            ledger.try_reserve(1),
            Err(PayanyError::BudgetExceeded {
                projected_msat: 10_001,
                cap_msat: 10_000
            })
        ));
    }

    #[test]
    fn old_payments_roll_out_of_the_window() {
        let (ledger, now) = ledger_at(budget(HOUR, 10_000), 1_000_000);
        ledger.try_reserve(9_000).unwrap().finalize(9_000);
        assert!(ledger.try_reserve(2_000).is_err());

        now.fetch_add(HOUR as i64 + 1, Ordering::SeqCst);
        let r = ledger.try_reserve(2_000).unwrap();
        assert_eq!(r.amount_msat(), 2_000);
        r.release();
    }

    #[test]
    fn shrinking_the_window_excludes_entries_immediately() {
        let (ledger, now) = ledger_at(budget(10 * HOUR, 10_000), 1_000_000);
        ledger.try_reserve(8_000).unwrap().finalize(8_000);
        now.fetch_add(2 * HOUR as i64, Ordering::SeqCst);
        assert!(ledger.try_reserve(5_000).is_err());

        ledger.reconfigure(budget(HOUR, 10_000));
        ledger.try_reserve(5_000).unwrap().release();

        // Widening again brings the retained entry back into view.
        ledger.reconfigure(budget(10 * HOUR, 10_000));
        assert!(ledger.try_reserve(5_000).is_err());
    }

    #[test]
    fn raising_the_cap_admits_a_rejected_amount() {
        let (ledger, _) = ledger_at(budget(HOUR, 1_000), 0);
        ledger.try_reserve(800).unwrap().finalize(800);
        assert!(ledger.try_reserve(500).is_err());
        ledger.reconfigure(budget(HOUR, 2_000));
        ledger.try_reserve(500).unwrap().finalize(500);
        assert_eq!(ledger.usage().spent_msat, 1_300);
    }

    #[test]
    fn outstanding_reservations_count_but_are_not_committed() {
        let (ledger, _) = ledger_at(budget(HOUR, 1_000), 0);
        let held = ledger.try_reserve(700).unwrap();
        assert!(ledger.try_reserve(400).is_err());
        assert_eq!(ledger.usage().reserved_msat, 700);
        assert_eq!(ledger.usage().spent_msat, 0);

        ledger.release(held);
        assert_eq!(ledger.usage().reserved_msat, 0);
        ledger.try_reserve(400).unwrap().release();
    }

    #[test]
    fn dropped_reservation_is_released() {
        let (ledger, _) = ledger_at(budget(HOUR, 1_000), 0);
        {
            let _held = ledger.try_reserve(900).unwrap();
            assert!(ledger.try_reserve(200).is_err());
        }
        assert_eq!(ledger.usage().reserved_msat, 0);
        assert_eq!(ledger.usage().spent_msat, 0);
    }

    #[test]
    fn finalize_records_actual_spend_not_candidate() {
        let (ledger, _) = ledger_at(budget(HOUR, 100_000), 0);
        let r = ledger.try_reserve(20_000).unwrap();
        let entry = ledger.finalize(r, 10_050);
        assert_eq!(entry.amount_msat, 10_050);
        assert_eq!(ledger.usage().spent_msat, 10_050);
    }

    #[test]
    fn reconfigure_keeps_inflight_reservations() {
        let (ledger, _) = ledger_at(budget(HOUR, 10_000), 0);
        let held = ledger.try_reserve(9_000).unwrap();
        ledger.reconfigure(budget(HOUR, 1_000));
        held.finalize(9_000);
        assert_eq!(ledger.usage().spent_msat, 9_000);
    }

    #[test]
    fn no_budget_still_records_spend() {
        let (ledger, _) = ledger_at(None, 0);
        ledger.try_reserve(u64::MAX).unwrap().finalize(5_000);
        let usage = ledger.usage();
        assert_eq!(usage.spent_msat, 5_000);
        assert_eq!(usage.remaining_msat, None);

        ledger.reconfigure(budget(HOUR, 6_000));
        assert!(ledger.try_reserve(2_000).is_err());
    }

    #[test]
    fn restored_entries_count_once_the_window_widens() {
        let now = 100_000_000;
        let (ledger, _) = ledger_at(budget(HOUR, 10_000), now);
        let restored = ledger.restore(vec![
            LedgerEntry {
                timestamp: now - 40 * 24 * HOUR as i64,
                amount_msat: 7_000,
            },
            LedgerEntry {
                timestamp: now - 2 * HOUR as i64,
                amount_msat: 5_000,
            },
            LedgerEntry {
                timestamp: now - 60,
                amount_msat: 3_000,
            },
        ]);
        assert_eq!(restored, 2);
        assert_eq!(ledger.usage().spent_msat, 3_000);

        ledger.reconfigure(budget(5 * HOUR, 10_000));
        assert_eq!(ledger.usage().spent_msat, 8_000);
        assert!(ledger.try_reserve(2_001).is_err());
    }

    #[test]
    fn concurrent_reservations_never_exceed_the_cap() {
        let (ledger, _) = ledger_at(budget(HOUR, 10_000), 0);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || match ledger.try_reserve(1_000) {
                    Ok(r) => {
                        r.finalize(1_000);
                        true
                    }
                    Err(_) => false,
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 10);
        assert_eq!(ledger.usage().spent_msat, 10_000);
    }
}

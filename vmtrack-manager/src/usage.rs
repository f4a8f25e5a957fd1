//! Usage Calculator (C6).
//!
//! Turns a set of sessions overlapping a query window into billable
//! seconds, a daily breakdown and, if a rental/rate is on file, a cost
//! estimate. Read-only: never touches the session log.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::store::{BillingCycle, Rental, Session, SessionStore};

const HOUR_SECONDS: i64 = 3600;
const WEEK_SECONDS: i64 = 7 * 86_400;
const MONTH_SECONDS: i64 = 30 * 86_400;

#[derive(Debug, Clone)]
pub struct DailyUsage {
    pub date: chrono::NaiveDate,
    pub seconds: i64,
}

/// Cost is exact for hourly billing and an approximation (fixed
/// 7-day/30-day period length, not calendar weeks/months) for weekly
/// and monthly — `is_approximate` lets callers label it accordingly
/// rather than presenting every estimate with the same confidence.
#[derive(Debug, Clone, Copy)]
pub struct CostEstimate {
    pub cost: f64,
    pub is_approximate: bool,
}

#[derive(Debug, Clone)]
pub struct UsageReport {
    pub vm_id: String,
    pub node: Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_seconds: i64,
    pub daily: Vec<DailyUsage>,
    pub session_count: usize,
    pub estimated_cost: Option<CostEstimate>,
}

pub struct UsageCalculator {
    store: Arc<dyn SessionStore>,
}

impl UsageCalculator {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Computes total billable seconds for `vm_id` within `[t0, t1]`,
    /// clipping every overlapping session to the window and clamping any
    /// still-open session's end to `now`.
    pub async fn usage(
        &self,
        vm_id: &str,
        node: Option<&str>,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> UsageReport {
        let sessions = self.store.sessions_overlapping(vm_id, node, t0, t1).await;
        let now = Utc::now();

        let mut total = 0i64;
        let mut daily: std::collections::BTreeMap<chrono::NaiveDate, i64> = std::collections::BTreeMap::new();

        for session in &sessions {
            let end = session.end_time.unwrap_or(now).min(t1);
            let start = session.start_time.max(t0);
            if end <= start {
                continue;
            }
            total += (end - start).num_seconds();
            accumulate_daily(&mut daily, start, end);
        }

        let rental = self.store.find_rental(node, vm_id).await;
        let estimated_cost = rental.as_ref().and_then(|r| estimate_cost(r, total));

        UsageReport {
            vm_id: vm_id.to_string(),
            node: node.map(str::to_string),
            window_start: t0,
            window_end: t1,
            total_seconds: total,
            daily: daily
                .into_iter()
                .map(|(date, seconds)| DailyUsage { date, seconds })
                .collect(),
            session_count: sessions.len(),
            estimated_cost,
        }
    }

    /// The sessions that make up the report, for callers that need the
    /// raw rows (e.g. an export endpoint) rather than just the totals.
    pub async fn sessions_in_window(
        &self,
        vm_id: &str,
        node: Option<&str>,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Vec<Session> {
        self.store.sessions_overlapping(vm_id, node, t0, t1).await
    }
}

/// Walks `[start, end)` one UTC calendar day at a time, crediting each
/// day the portion of the interval that falls on it.
fn accumulate_daily(
    daily: &mut std::collections::BTreeMap<chrono::NaiveDate, i64>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) {
    let mut cursor = start;
    while cursor < end {
        let day = cursor.date_naive();
        let next_midnight = Utc
            .from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap())
            + Duration::days(1);
        let segment_end = next_midnight.min(end);
        let seconds = (segment_end - cursor).num_seconds();
        *daily.entry(day).or_insert(0) += seconds;
        cursor = segment_end;
    }
}

/// Hourly billing is exact (`total_seconds / 3600 * rate`). Weekly and
/// monthly are an approximation using a fixed period length rather than
/// calendar weeks/months, matching how the source system prices partial
/// periods. No rate on file means no cost, not a zero cost.
fn estimate_cost(rental: &Rental, total_seconds: i64) -> Option<CostEstimate> {
    let rate = rental.rate?;
    let (cost, is_approximate) = match rental.billing_cycle {
        BillingCycle::Hourly => ((total_seconds as f64 / HOUR_SECONDS as f64) * rate, false),
        BillingCycle::Weekly => ((total_seconds as f64 / WEEK_SECONDS as f64) * rate, true),
        BillingCycle::Monthly => ((total_seconds as f64 / MONTH_SECONDS as f64) * rate, true),
    };
    Some(CostEstimate { cost, is_approximate })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemorySessionStore, VmKind};

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn clips_session_to_window() {
        let store = Arc::new(InMemorySessionStore::new());
        let session = store
            .open_session("a", "42", VmKind::FullVm, t("2025-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .close_session(&session.id, t("2025-01-03T00:00:00Z"))
            .await
            .unwrap();

        let calc = UsageCalculator::new(store);
        let report = calc
            .usage(
                "42",
                Some("a"),
                t("2025-01-01T12:00:00Z"),
                t("2025-01-02T12:00:00Z"),
            )
            .await;

        assert_eq!(report.total_seconds, 86_400);
    }

    #[tokio::test]
    async fn daily_breakdown_splits_across_midnight() {
        let store = Arc::new(InMemorySessionStore::new());
        let session = store
            .open_session("a", "42", VmKind::FullVm, t("2025-01-01T22:00:00Z"))
            .await
            .unwrap();
        store
            .close_session(&session.id, t("2025-01-02T02:00:00Z"))
            .await
            .unwrap();

        let calc = UsageCalculator::new(store);
        let report = calc
            .usage(
                "42",
                Some("a"),
                t("2025-01-01T00:00:00Z"),
                t("2025-01-03T00:00:00Z"),
            )
            .await;

        assert_eq!(report.daily.len(), 2);
        assert_eq!(report.daily[0].seconds, 2 * HOUR_SECONDS);
        assert_eq!(report.daily[1].seconds, 2 * HOUR_SECONDS);
    }

    #[tokio::test]
    async fn open_session_clamps_to_now_not_window_end() {
        let store = Arc::new(InMemorySessionStore::new());
        store
            .open_session("a", "42", VmKind::FullVm, t("2025-01-01T00:00:00Z"))
            .await
            .unwrap();

        let calc = UsageCalculator::new(store);
        let far_future = Utc::now() + Duration::days(365);
        let report = calc.usage("42", Some("a"), t("2025-01-01T00:00:00Z"), far_future).await;

        // An open session can't contribute more than "now - start"; it
        // must not be credited all the way out to the window end.
        assert!(report.total_seconds < 366 * 86_400);
    }

    #[tokio::test]
    async fn no_rental_means_no_cost() {
        let store = Arc::new(InMemorySessionStore::new());
        let calc = UsageCalculator::new(store);
        let report = calc
            .usage("42", Some("a"), t("2025-01-01T00:00:00Z"), t("2025-01-02T00:00:00Z"))
            .await;
        assert!(report.estimated_cost.is_none());
    }

    #[tokio::test]
    async fn window_additivity_splits_match_whole() {
        let store = Arc::new(InMemorySessionStore::new());
        let session = store
            .open_session("a", "42", VmKind::FullVm, t("2025-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .close_session(&session.id, t("2025-01-05T00:00:00Z"))
            .await
            .unwrap();

        let calc = UsageCalculator::new(store);
        let whole = calc
            .usage("42", Some("a"), t("2025-01-01T00:00:00Z"), t("2025-01-05T00:00:00Z"))
            .await;
        let first_half = calc
            .usage("42", Some("a"), t("2025-01-01T00:00:00Z"), t("2025-01-03T00:00:00Z"))
            .await;
        let second_half = calc
            .usage("42", Some("a"), t("2025-01-03T00:00:00Z"), t("2025-01-05T00:00:00Z"))
            .await;

        assert_eq!(whole.total_seconds, first_half.total_seconds + second_half.total_seconds);
    }

    #[tokio::test]
    async fn hourly_rental_cost_is_exact_not_approximate() {
        let store = Arc::new(InMemorySessionStore::new());
        let session = store
            .open_session("a", "42", VmKind::FullVm, t("2025-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .close_session(&session.id, t("2025-01-01T02:00:00Z"))
            .await
            .unwrap();
        store
            .upsert_rental(Rental {
                id: "r1".into(),
                node: Some("a".into()),
                vm_id: "42".into(),
                customer: None,
                rental_start: t("2025-01-01T00:00:00Z"),
                rental_end: None,
                billing_cycle: BillingCycle::Hourly,
                rate: Some(5.0),
                is_active: true,
                notes: None,
            })
            .await;

        let calc = UsageCalculator::new(store);
        let report = calc
            .usage("42", Some("a"), t("2025-01-01T00:00:00Z"), t("2025-01-02T00:00:00Z"))
            .await;

        let cost = report.estimated_cost.unwrap();
        assert_eq!(cost.cost, 10.0);
        assert!(!cost.is_approximate);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::store::{InMemorySessionStore, VmKind};
    use proptest::prelude::*;

    fn epoch_plus(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    proptest! {
        /// P6: usage over `[t0, t2]` equals usage over `[t0, t1]` plus
        /// usage over `[t1, t2]` for any split point `t1` in between —
        /// windows never double-count or drop seconds at a boundary.
        #[test]
        fn p6_window_additivity(
            session_len in 1i64..200_000,
            split_offset in 0i64..200_000,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let store = Arc::new(InMemorySessionStore::new());
                let start = epoch_plus(0);
                let end = epoch_plus(session_len);
                let session = store
                    .open_session("a", "42", VmKind::FullVm, start)
                    .await
                    .unwrap();
                store.close_session(&session.id, end).await.unwrap();

                let split = epoch_plus(split_offset.min(session_len));

                let calc = UsageCalculator::new(store);
                let whole = calc.usage("42", Some("a"), start, end).await;
                let first = calc.usage("42", Some("a"), start, split).await;
                let second = calc.usage("42", Some("a"), split, end).await;

                prop_assert_eq!(whole.total_seconds, first.total_seconds + second.total_seconds);
                Ok(())
            })?;
        }
    }
}

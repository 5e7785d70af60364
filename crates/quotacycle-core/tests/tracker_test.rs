//! Integration tests for the quota tracker against a real SQLite store

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use quotacycle_core::db::Database;
use quotacycle_core::services::quota::{
    CycleStore, ProviderKind, ProviderPolicy, QuotaKey, QuotaReading, QuotaTracker, ResetReason,
    SqliteCycleStore, TrackOutcome, TuningConfig,
};
use quotacycle_core::Error;
use support::FaultyStore;
use tempfile::TempDir;

/// Helper to create a test database and store
async fn create_test_store() -> (Arc<SqliteCycleStore>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(temp_dir.path().join("test.db"))
        .await
        .expect("Failed to create test database");
    (Arc::new(SqliteCycleStore::new(db.pool)), temp_dir)
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 4, 9, 0, 0).unwrap()
}

fn minutes(m: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(m)
}

fn tracker(provider: ProviderKind, store: &Arc<SqliteCycleStore>) -> QuotaTracker {
    QuotaTracker::from_config(provider, store.clone(), &TuningConfig::default())
}

fn anthropic(value: f64, at: DateTime<Utc>, reset: DateTime<Utc>) -> QuotaReading {
    QuotaReading::new(QuotaKey::new(ProviderKind::Anthropic, "five_hour"), value, at)
        .with_expected_reset(reset)
}

#[tokio::test]
async fn test_first_reading_creates_cycle() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Anthropic, &store);
    let reset = minutes(300);

    let outcome = tracker.process(&anthropic(20.0, t0(), reset)).await.unwrap();
    assert!(matches!(outcome, TrackOutcome::Created { .. }));

    let key = QuotaKey::new(ProviderKind::Anthropic, "five_hour");
    let cycle = store.query_active_cycle(&key).await.unwrap().unwrap();
    assert_eq!(cycle.cycle_start, t0());
    assert_eq!(cycle.expected_reset, Some(reset));
    assert_eq!(cycle.peak_value, 20.0);
    assert_eq!(cycle.cumulative_delta, 0.0);
    assert!(tracker.last_seen("five_hour").is_some());
}

#[tokio::test]
async fn test_end_to_end_accumulates_peak_and_delta() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Anthropic, &store);
    let reset = minutes(300);

    tracker.process(&anthropic(20.0, minutes(0), reset)).await.unwrap();
    tracker.process(&anthropic(35.0, minutes(5), reset)).await.unwrap();
    let outcome = tracker.process(&anthropic(60.0, minutes(10), reset)).await.unwrap();

    assert_eq!(
        outcome,
        TrackOutcome::Updated {
            peak_value: 60.0,
            cumulative_delta: 40.0
        }
    );

    let key = QuotaKey::new(ProviderKind::Anthropic, "five_hour");
    let cycle = store.query_active_cycle(&key).await.unwrap().unwrap();
    assert_eq!(cycle.peak_value, 60.0);
    assert_eq!(cycle.cumulative_delta, 40.0);
    assert!(store.query_cycle_history(&key, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reset_closes_cycle_and_fires_observer_once() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Anthropic, &store);
    let fired = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&fired);
    tracker.on_reset(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let reset = minutes(300);
    let next_reset = reset + Duration::hours(5);
    tracker.process(&anthropic(20.0, minutes(0), reset)).await.unwrap();
    tracker.process(&anthropic(35.0, minutes(5), reset)).await.unwrap();
    tracker.process(&anthropic(60.0, minutes(10), reset)).await.unwrap();

    let outcome = tracker.process(&anthropic(5.0, minutes(15), next_reset)).await.unwrap();
    let TrackOutcome::Reset(event) = outcome else {
        panic!("expected reset, got {:?}", outcome);
    };
    assert_eq!(event.reason, ResetReason::ExpectedResetJump);
    assert_eq!(event.closed_peak, 60.0);
    assert_eq!(event.closed_delta, 40.0);
    // Stored reset is still in the future, so the poll time closes the cycle
    assert_eq!(event.closed_at, minutes(15));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Further readings in the new cycle do not fire again
    tracker.process(&anthropic(9.0, minutes(20), next_reset)).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let key = QuotaKey::new(ProviderKind::Anthropic, "five_hour");
    let history = store.query_cycle_history(&key, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].peak_value, 60.0);
    assert_eq!(history[0].cumulative_delta, 40.0);

    let active = store.query_active_cycle(&key).await.unwrap().unwrap();
    assert_eq!(active.id, event.new_cycle_id);
    assert_eq!(active.cycle_start, minutes(15));
    assert_eq!(active.expected_reset, Some(next_reset));
    assert_eq!(active.peak_value, 9.0);
    assert_eq!(active.cumulative_delta, 4.0);
}

#[tokio::test]
async fn test_delta_ignores_drops_and_peak_never_falls() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Anthropic, &store);
    let reset = minutes(300);
    let values = [10.0, 30.0, 25.0, 40.0, 38.0, 39.0];

    let mut last_peak = 0.0;
    let mut last_delta = 0.0;
    for (i, value) in values.iter().enumerate() {
        let outcome = tracker
            .process(&anthropic(*value, minutes(i as i64 * 5), reset))
            .await
            .unwrap();
        if let TrackOutcome::Updated {
            peak_value,
            cumulative_delta,
        } = outcome
        {
            assert!(peak_value >= last_peak);
            assert!(cumulative_delta >= last_delta);
            last_peak = peak_value;
            last_delta = cumulative_delta;
        }
    }

    // 20 + 15 + 1
    assert_eq!(last_delta, 36.0);
    assert_eq!(last_peak, 40.0);
}

#[tokio::test]
async fn test_jitter_never_closes_cycle() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Anthropic, &store);
    let reset = minutes(300);

    for step in 0..20 {
        let jittered = reset + Duration::minutes(9 * step);
        let outcome = tracker
            .process(&anthropic(10.0 + step as f64, minutes(step), jittered))
            .await
            .unwrap();
        assert!(!matches!(outcome, TrackOutcome::Reset(_)), "step {}", step);
    }

    let key = QuotaKey::new(ProviderKind::Anthropic, "five_hour");
    assert!(store.query_cycle_history(&key, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_time_expiry_closes_at_stored_reset() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Anthropic, &store);
    let reset = minutes(60);

    tracker.process(&anthropic(30.0, minutes(0), reset)).await.unwrap();
    tracker.process(&anthropic(50.0, minutes(30), reset)).await.unwrap();

    // Offline across the reset; the provider now reports a fresh window
    let outcome = tracker
        .process(&anthropic(4.0, minutes(180), minutes(480)))
        .await
        .unwrap();
    let TrackOutcome::Reset(event) = outcome else {
        panic!("expected reset");
    };
    assert_eq!(event.reason, ResetReason::TimeExpiry);
    assert_eq!(event.closed_at, reset);
    assert_eq!(event.closed_peak, 50.0);
    assert_eq!(event.closed_delta, 20.0);
}

#[tokio::test]
async fn test_restart_updates_existing_cycle_without_delta() {
    let (store, _temp_dir) = create_test_store().await;
    let reset = minutes(300);
    let key = QuotaKey::new(ProviderKind::Anthropic, "five_hour");

    {
        let mut before = tracker(ProviderKind::Anthropic, &store);
        before.process(&anthropic(20.0, minutes(0), reset)).await.unwrap();
        before.process(&anthropic(30.0, minutes(5), reset)).await.unwrap();
    }

    // Fresh tracker: no last-seen state, but an active cycle exists
    let mut after = tracker(ProviderKind::Anthropic, &store);
    let outcome = after.process(&anthropic(45.0, minutes(60), reset)).await.unwrap();
    assert_eq!(
        outcome,
        TrackOutcome::Updated {
            peak_value: 45.0,
            cumulative_delta: 10.0
        }
    );

    let outcome = after.process(&anthropic(50.0, minutes(65), reset)).await.unwrap();
    assert_eq!(
        outcome,
        TrackOutcome::Updated {
            peak_value: 50.0,
            cumulative_delta: 15.0
        }
    );
    assert!(store.query_cycle_history(&key, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_primed_tracker_counts_step_from_latest_snapshot() {
    let (store, _temp_dir) = create_test_store().await;
    let reset = minutes(300);
    let key = QuotaKey::new(ProviderKind::Anthropic, "five_hour");

    let first = anthropic(20.0, minutes(0), reset);
    store.insert_snapshot(&first).await.unwrap();
    tracker(ProviderKind::Anthropic, &store)
        .process(&first)
        .await
        .unwrap();

    let mut fresh = tracker(ProviderKind::Anthropic, &store);
    let latest = store.query_latest_snapshot(&key).await.unwrap().unwrap();
    fresh.prime("five_hour", &latest);
    assert_eq!(fresh.last_seen("five_hour").map(|l| l.value), Some(20.0));

    let outcome = fresh.process(&anthropic(35.0, minutes(5), reset)).await.unwrap();
    assert_eq!(
        outcome,
        TrackOutcome::Updated {
            peak_value: 35.0,
            cumulative_delta: 15.0
        }
    );
}

#[tokio::test]
async fn test_forget_drops_last_seen() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Anthropic, &store);
    let reset = minutes(300);

    tracker.process(&anthropic(20.0, minutes(0), reset)).await.unwrap();
    tracker.forget("five_hour");
    assert!(tracker.last_seen("five_hour").is_none());

    let outcome = tracker.process(&anthropic(25.0, minutes(5), reset)).await.unwrap();
    assert_eq!(
        outcome,
        TrackOutcome::Updated {
            peak_value: 25.0,
            cumulative_delta: 0.0
        }
    );

    tracker.clear_last_seen();
    assert!(tracker.last_seen("five_hour").is_none());
}

#[tokio::test]
async fn test_rejects_reading_for_other_provider() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Zai, &store);
    let err = tracker
        .process(&anthropic(1.0, t0(), minutes(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_zai_tokens_reset_on_exact_change() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Zai, &store);
    let key = QuotaKey::new(ProviderKind::Zai, "tokens");
    let reset = minutes(24 * 60);

    let reading = |value: f64, at: i64, reset: DateTime<Utc>| {
        QuotaReading::new(key.clone(), value, minutes(at)).with_expected_reset(reset)
    };

    tracker.process(&reading(1000.0, 0, reset)).await.unwrap();
    tracker.process(&reading(5000.0, 10, reset)).await.unwrap();
    let outcome = tracker
        .process(&reading(100.0, 20, reset + Duration::seconds(1)))
        .await
        .unwrap();
    assert!(matches!(outcome, TrackOutcome::Reset(ref e) if e.reason == ResetReason::ExpectedResetJump));
}

#[tokio::test]
async fn test_zai_time_budget_resets_on_halving() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Zai, &store);
    let key = QuotaKey::new(ProviderKind::Zai, "time");

    tracker.process(&QuotaReading::new(key.clone(), 400.0, minutes(0))).await.unwrap();
    let outcome = tracker
        .process(&QuotaReading::new(key.clone(), 250.0, minutes(10)))
        .await
        .unwrap();
    assert!(matches!(outcome, TrackOutcome::Updated { .. }));

    let outcome = tracker
        .process(&QuotaReading::new(key.clone(), 100.0, minutes(20)))
        .await
        .unwrap();
    assert!(matches!(outcome, TrackOutcome::Reset(ref e) if e.reason == ResetReason::ValueDrop));
}

#[tokio::test]
async fn test_synthetic_rolling_window_creep_is_not_reset() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Synthetic, &store);
    let key = QuotaKey::new(ProviderKind::Synthetic, "search");
    // Window renews at 10:05; the reported reset creeps forward each poll
    let base = Utc.with_ymd_and_hms(2026, 2, 4, 10, 5, 0).unwrap();

    for step in 0..5 {
        let reading = QuotaReading::new(key.clone(), 10.0 + step as f64, minutes(step * 5))
            .with_expected_reset(base + Duration::minutes(step * 5));
        let outcome = tracker.process(&reading).await.unwrap();
        assert!(!matches!(outcome, TrackOutcome::Reset(_)));
    }

    let next_hour = QuotaReading::new(key.clone(), 1.0, minutes(30))
        .with_expected_reset(base + Duration::hours(1));
    let outcome = tracker.process(&next_hour).await.unwrap();
    assert!(matches!(outcome, TrackOutcome::Reset(ref e) if e.reason == ResetReason::ExpectedResetHourChanged));
}

#[tokio::test]
async fn test_codex_follows_rolling_reset_without_drop() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Codex, &store);
    let key = QuotaKey::new(ProviderKind::Codex, "five_hour");
    let reset = minutes(300);

    tracker
        .process(&QuotaReading::new(key.clone(), 20.0, minutes(0)).with_expected_reset(reset))
        .await
        .unwrap();

    // Big shift but usage kept rising: follow the new timestamp instead of resetting
    let shifted = reset + Duration::minutes(90);
    let outcome = tracker
        .process(&QuotaReading::new(key.clone(), 22.0, minutes(5)).with_expected_reset(shifted))
        .await
        .unwrap();
    assert!(matches!(outcome, TrackOutcome::Updated { .. }));
    let active = store.query_active_cycle(&key).await.unwrap().unwrap();
    assert_eq!(active.expected_reset, Some(shifted));

    // Shift with a real drop resets
    let outcome = tracker
        .process(
            &QuotaReading::new(key.clone(), 3.0, minutes(10))
                .with_expected_reset(shifted + Duration::hours(5)),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, TrackOutcome::Reset(ref e) if e.reason == ResetReason::ExpectedResetJumpWithDrop));
}

#[tokio::test]
async fn test_antigravity_remaining_fraction_increase_resets() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Antigravity, &store);
    let key = QuotaKey::new(ProviderKind::Antigravity, "gemini-3-pro");

    let reading = |remaining: f64, at: i64| {
        QuotaReading::from_remaining_fraction(key.clone(), remaining, minutes(at))
    };

    tracker.process(&reading(0.9, 0)).await.unwrap();
    tracker.process(&reading(0.5, 10)).await.unwrap();
    let outcome = tracker.process(&reading(0.95, 20)).await.unwrap();
    let TrackOutcome::Reset(event) = outcome else {
        panic!("expected reset");
    };
    assert_eq!(event.reason, ResetReason::AbsoluteDrop);
    assert!((event.closed_peak - 0.5).abs() < 1e-9);
    assert!((event.closed_delta - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn test_minimax_window_change_resets() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::MiniMax, &store);
    let key = QuotaKey::new(ProviderKind::MiniMax, "MiniMax-M2");
    let w1 = (minutes(0), minutes(300));
    let w2 = (minutes(300), minutes(600));

    tracker
        .process(&QuotaReading::new(key.clone(), 40.0, minutes(10)).with_window(Some(w1.0), Some(w1.1)))
        .await
        .unwrap();
    let outcome = tracker
        .process(&QuotaReading::new(key.clone(), 30.0, minutes(310)).with_window(Some(w2.0), Some(w2.1)))
        .await
        .unwrap();
    assert!(matches!(outcome, TrackOutcome::Reset(ref e) if e.reason == ResetReason::WindowChanged));
}

#[tokio::test]
async fn test_observers_see_events_in_order() {
    let (store, _temp_dir) = create_test_store().await;
    let policy = ProviderPolicy::default_for(ProviderKind::Copilot);
    let mut tracker = QuotaTracker::new(ProviderKind::Copilot, store.clone(), policy);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    tracker.on_reset(move |event| sink.lock().unwrap().push(event.closed_peak));

    let key = QuotaKey::new(ProviderKind::Copilot, "premium_interactions");
    let month = |m: u32| Utc.with_ymd_and_hms(2026, m, 1, 0, 0, 0).unwrap();

    tracker
        .process(&QuotaReading::new(key.clone(), 100.0, month(1) + Duration::days(3)).with_expected_reset(month(2)))
        .await
        .unwrap();
    tracker
        .process(&QuotaReading::new(key.clone(), 10.0, month(2) + Duration::days(3)).with_expected_reset(month(3)))
        .await
        .unwrap();
    tracker
        .process(&QuotaReading::new(key.clone(), 5.0, month(3) + Duration::days(3)).with_expected_reset(month(4)))
        .await
        .unwrap();

    assert_eq!(*events.lock().unwrap(), vec![100.0, 10.0]);

    let history = store.query_cycle_history(&key, None).await.unwrap();
    assert_eq!(history.len(), 2);
    // Newest first; closed at the stored reset boundary
    assert_eq!(history[0].cycle_end, Some(month(3)));
    assert_eq!(history[1].cycle_end, Some(month(2)));
}

#[tokio::test]
async fn test_missing_reset_for_one_poll_is_not_a_reset() {
    let (store, _temp_dir) = create_test_store().await;
    let mut tracker = tracker(ProviderKind::Anthropic, &store);
    let key = QuotaKey::new(ProviderKind::Anthropic, "five_hour");
    let reset = minutes(300);

    tracker.process(&anthropic(20.0, minutes(0), reset)).await.unwrap();

    // Provider omitted the reset timestamp on one poll
    let outcome = tracker
        .process(&QuotaReading::new(key.clone(), 22.0, minutes(5)))
        .await
        .unwrap();
    assert!(matches!(outcome, TrackOutcome::Updated { .. }));
    assert_eq!(
        tracker.last_seen("five_hour").and_then(|l| l.expected_reset),
        Some(reset)
    );

    let outcome = tracker.process(&anthropic(23.0, minutes(10), reset)).await.unwrap();
    assert_eq!(
        outcome,
        TrackOutcome::Updated {
            peak_value: 23.0,
            cumulative_delta: 3.0
        }
    );
    assert!(store.query_cycle_history(&key, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_write_leaves_cycle_and_last_seen_consistent() {
    let (store, _temp_dir) = create_test_store().await;
    let faulty = Arc::new(FaultyStore::new(store.clone()));
    let mut tracker =
        QuotaTracker::from_config(ProviderKind::Codex, faulty.clone(), &TuningConfig::default());
    let key = QuotaKey::new(ProviderKind::Codex, "five_hour");
    let reset = minutes(300);
    let shifted = reset + Duration::minutes(90);

    tracker
        .process(&QuotaReading::new(key.clone(), 20.0, minutes(0)).with_expected_reset(reset))
        .await
        .unwrap();

    faulty.fail_next("update_cycle_with_reset");
    let err = tracker
        .process(&QuotaReading::new(key.clone(), 35.0, minutes(5)).with_expected_reset(shifted))
        .await
        .unwrap_err();
    assert_eq!(err.quota(), Some("codex/five_hour"));
    assert!(err.to_string().contains("update cycle"));

    // Nothing from the failed reading was written or remembered
    let active = store.query_active_cycle(&key).await.unwrap().unwrap();
    assert_eq!(active.cumulative_delta, 0.0);
    assert_eq!(active.peak_value, 20.0);
    assert_eq!(active.expected_reset, Some(reset));
    assert_eq!(tracker.last_seen("five_hour").map(|l| l.value), Some(20.0));

    let outcome = tracker
        .process(&QuotaReading::new(key.clone(), 40.0, minutes(10)).with_expected_reset(shifted))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TrackOutcome::Updated {
            peak_value: 40.0,
            cumulative_delta: 20.0
        }
    );
    let active = store.query_active_cycle(&key).await.unwrap().unwrap();
    assert_eq!(active.cumulative_delta, 20.0);
    assert_eq!(active.expected_reset, Some(shifted));
}

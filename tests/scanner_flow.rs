use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use scanhead_lib::{
    db::models::{OperationFilter, OperationKind},
    scanner::{
        Direction, OperationStatus, Position, ScannerController, ScannerEvent, ScannerSnapshot,
    },
    settings::Settings,
    AppState,
};
use tokio::sync::mpsc;

fn fast_settings(dir: &tempfile::TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.database.path = dir.path().join("flow.sqlite3");
    settings.scanner.movement_speed_multiplier = 0.05;
    settings.scanner.focus_duration_secs = 0.1;
    settings.scanner.settle_delay_ms = 20;
    settings.scanner.poll_interval_ms = 10;
    settings
}

async fn wait_until_idle(scanner: &ScannerController) -> Arc<ScannerSnapshot> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = scanner.get_state_snapshot().await;
        if !snapshot.is_processing && snapshot.operation_status == OperationStatus::Ready {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "scanner never settled: {snapshot:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn moves_are_executed_captured_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::open(fast_settings(&dir)).unwrap();
    let scanner = state.scanners.get_or_create("abcd").await.unwrap();

    for direction in [Direction::Right, Direction::Right, Direction::Up] {
        let outcome = scanner.queue_movement(direction, Some("sess1")).await.unwrap();
        assert!(outcome.is_accepted());
    }

    let snapshot = wait_until_idle(&scanner).await;
    assert_eq!(snapshot.current_position, Position::new(7, 6));
    assert!(snapshot.captured_positions.contains(&Position::new(7, 6)));

    let stored = state.db.get_scanner_state("abcd").await.unwrap().unwrap();
    assert_eq!(stored.position, Position::new(7, 6));
    assert!(stored.pending.is_zero());

    let captures = state.db.list_captures("abcd", None, 100).await.unwrap();
    assert_eq!(captures[0].position, Position::new(7, 6));

    let queued = state
        .db
        .list_operations(
            "abcd",
            &OperationFilter {
                operation_type: Some(OperationKind::QueueMove),
                ..OperationFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(queued.len(), 3);
    assert!(queued
        .iter()
        .all(|op| op.session_id.as_deref() == Some("sess1")));
}

#[tokio::test]
async fn moves_past_the_wall_are_rejected_with_a_notice() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::open(fast_settings(&dir)).unwrap();
    let scanner = state.scanners.get_or_create("wall1").await.unwrap();

    let (tx, mut rx) = mpsc::channel(512);
    scanner.connect_client("watcher", tx).await;

    for _ in 0..5 {
        assert!(scanner
            .queue_movement(Direction::Left, None)
            .await
            .unwrap()
            .is_accepted());
    }
    let outcome = scanner.queue_movement(Direction::Left, None).await.unwrap();
    assert!(!outcome.is_accepted());

    let snapshot = wait_until_idle(&scanner).await;
    assert_eq!(snapshot.current_position, Position::new(0, 5));

    let mut saw_rejection = false;
    while let Ok(event) = rx.try_recv() {
        if let ScannerEvent::Log(notice) = event {
            saw_rejection |= notice.message.contains("rejected");
        }
    }
    assert!(saw_rejection);
}

#[tokio::test]
async fn reset_clears_durable_history() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::open(fast_settings(&dir)).unwrap();
    let scanner = state.scanners.get_or_create("rst1").await.unwrap();

    scanner.queue_movement(Direction::Down, Some("s1")).await.unwrap();
    wait_until_idle(&scanner).await;
    assert!(!state.db.list_captures("rst1", None, 10).await.unwrap().is_empty());

    scanner.reset_scanner().await.unwrap();

    let snapshot = scanner.get_state_snapshot().await;
    assert_eq!(snapshot.current_position, Position::new(5, 5));
    assert!(snapshot.captured_positions.is_empty());
    assert!(state.db.list_captures("rst1", None, 10).await.unwrap().is_empty());
    assert!(state
        .db
        .list_operations("rst1", &OperationFilter::default())
        .await
        .unwrap()
        .is_empty());

    let stored = state.db.get_scanner_state("rst1").await.unwrap().unwrap();
    assert_eq!(stored.position, Position::new(5, 5));
    assert_eq!(stored.status, OperationStatus::Ready);
}

#[tokio::test]
async fn a_restarted_process_resumes_from_the_database() {
    let dir = tempfile::tempdir().unwrap();
    {
        let state = AppState::open(fast_settings(&dir)).unwrap();
        let scanner = state.scanners.get_or_create("keep1").await.unwrap();
        scanner.queue_movement(Direction::Up, None).await.unwrap();
        scanner.queue_movement(Direction::Up, None).await.unwrap();
        wait_until_idle(&scanner).await;
    }

    let state = AppState::open(fast_settings(&dir)).unwrap();
    let scanner = state.scanners.get_or_create("keep1").await.unwrap();
    let snapshot = scanner.get_state_snapshot().await;
    assert_eq!(snapshot.current_position, Position::new(5, 7));
    assert_eq!(snapshot.operation_status, OperationStatus::Ready);
    assert!(snapshot.captured_positions.contains(&Position::new(5, 7)));
}

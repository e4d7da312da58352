use dinoguard::{AlertEvent, AlertSeverity, SecurityAlertBus, SystemClock, TokioScheduler};
use std::sync::Arc;
use std::time::Duration;

fn tokio_bus() -> SecurityAlertBus {
    SecurityAlertBus::new(
        chrono::Duration::milliseconds(10_000),
        Arc::new(SystemClock),
        Arc::new(TokioScheduler::new()),
    )
}

async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_alert_removed_by_timer_after_ttl() {
    let bus = tokio_bus();
    let id = bus.publish(AlertSeverity::Warning, "Security problem", "Token expired");

    tokio::time::advance(Duration::from_millis(9_999)).await;
    settle().await;
    assert!(bus.get(id).is_some());

    tokio::time::advance(Duration::from_millis(2)).await;
    settle().await;
    assert!(bus.get(id).is_none());
    assert_eq!(bus.pending_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dismiss_cancels_timer_and_keeps_others() {
    let bus = tokio_bus();
    let mut events = bus.subscribe();

    let first = bus.publish(AlertSeverity::Info, "One", "first");
    let second = bus.publish(AlertSeverity::Info, "Two", "second");

    assert!(bus.dismiss(first));
    assert!(!bus.dismiss(first));
    assert_eq!(bus.pending_timers(), 1);
    assert_eq!(bus.list().iter().map(|a| a.id).collect::<Vec<_>>(), vec![second]);

    tokio::time::advance(Duration::from_millis(10_001)).await;
    settle().await;
    assert!(bus.is_empty());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen[0], AlertEvent::Published(ref a) if a.id == first));
    assert!(matches!(seen[1], AlertEvent::Published(ref a) if a.id == second));
    assert_eq!(seen[2], AlertEvent::Dismissed(first));
    assert_eq!(seen[3], AlertEvent::Expired(second));
}

#[tokio::test(start_paused = true)]
async fn test_dispose_stops_pending_timers() {
    let bus = tokio_bus();
    for n in 0..3 {
        bus.publish(AlertSeverity::Error, "Failure", format!("attempt {n}"));
    }
    assert_eq!(bus.pending_timers(), 3);

    bus.dispose();
    assert_eq!(bus.pending_timers(), 0);
    assert!(bus.is_empty());

    tokio::time::advance(Duration::from_millis(20_000)).await;
    settle().await;
    assert!(bus.is_empty());
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use fedsignal::sim::{JunctionId, JunctionLink, SimulationSession, TickBarrier};
use tokio::sync::Mutex;

const TICKS: u64 = 4;

/// Submits every tick after `delay`, checking the shared clock on both sides
async fn delayed_client(
    link: JunctionLink,
    session: SimulationSession,
    delay: Duration,
    trace: Arc<Mutex<Vec<(String, u64, u64)>>>,
) {
    for expected in 1..=TICKS {
        tokio::time::sleep(delay).await;
        let before = session.tick().unwrap();
        let step = link.submit(0).await.unwrap();
        let after = session.tick().unwrap();
        assert_eq!(step.info.tick, expected);
        trace
            .lock()
            .await
            .push((link.junction().to_string(), before, after));
    }
}

#[tokio::test]
async fn test_tick_waits_for_slowest_junction() {
    let ids = ["fast", "medium", "slow"];
    let session = common::session(&ids, 100, common::queue_only_reward());
    let (barrier, links) = TickBarrier::new(
        session.clone(),
        ids.iter().map(|id| JunctionId::from(*id)),
        Duration::from_secs(5),
    );
    let barrier = tokio::spawn(barrier.run());

    let trace = Arc::new(Mutex::new(Vec::new()));
    let mut clients = Vec::new();
    for link in links {
        let delay = match link.junction().as_str() {
            "fast" => Duration::from_millis(0),
            "medium" => Duration::from_millis(20),
            _ => Duration::from_millis(60),
        };
        clients.push(tokio::spawn(delayed_client(
            link,
            session.clone(),
            delay,
            Arc::clone(&trace),
        )));
    }
    for client in clients {
        client.await.unwrap();
    }
    let report = barrier.await.unwrap();
    assert_eq!(report.ticks, TICKS);
    assert!(report.evicted.is_empty());

    let trace = trace.lock().await;
    assert_eq!(trace.len(), 3 * TICKS as usize);
    for (junction, before, after) in trace.iter() {
        // the clock only moves once the slowest junction has submitted
        assert_eq!(after, &(before + 1), "{junction} saw {before} -> {after}");
    }
}

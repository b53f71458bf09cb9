//! Distributed time synchronization

use simbus::config::ParticipantConfiguration;
use simbus::net::Registry;
use simbus::participant::Participant;
use simbus::wire::message::MessageKind;
use simbus::{OperationMode, ParticipantState, PubSubSpec};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MS: i64 = 1_000_000;

async fn start_registry() -> (Registry, String) {
    let registry = Registry::start(&ParticipantConfiguration::default(), "silkit://127.0.0.1:0")
        .await
        .unwrap();
    let uri = registry.listen_uri().to_string();
    (registry, uri)
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn lone_synchronized_participant_advances_by_step_duration() {
    let (registry, uri) = start_registry().await;
    let p = Participant::connect(ParticipantConfiguration::default(), "Solo", &uri).await.unwrap();
    let lifecycle = p.create_lifecycle_service(OperationMode::Autonomous).unwrap();
    let time_sync = p.create_time_sync_service().unwrap();

    let ticks = Arc::new(Mutex::new(Vec::<(i64, i64)>::new()));
    let ticks2 = ticks.clone();
    let lc = lifecycle.clone();
    time_sync
        .set_simulation_step_handler(
            move |now, duration| {
                ticks2.lock().unwrap().push((now, duration));
                if now >= 20 * MS {
                    let _ = lc.stop("enough steps");
                }
            },
            MS,
        )
        .unwrap();

    lifecycle.start_lifecycle().unwrap();
    assert_eq!(lifecycle.wait_for_shutdown().await, ParticipantState::Shutdown);

    let ticks = ticks.lock().unwrap().clone();
    assert!(ticks.len() >= 21, "expected at least 21 steps, got {}", ticks.len());
    for (i, (now, duration)) in ticks.iter().enumerate() {
        assert_eq!(*now, i as i64 * MS, "step {} ran at the wrong time", i);
        assert_eq!(*duration, MS);
    }

    p.disconnect();
    registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn deterministic_multi_publisher_lockstep() {
    let (registry, uri) = start_registry().await;
    const STEPS: i64 = 50;

    let sub = Participant::connect(ParticipantConfiguration::default(), "Sub", &uri).await.unwrap();
    let pub0 = Participant::connect(ParticipantConfiguration::default(), "Pub0", &uri).await.unwrap();
    let pub1 = Participant::connect(ParticipantConfiguration::default(), "Pub1", &uri).await.unwrap();

    // Observations: (publisher index, message tick, subscriber time at receipt)
    let observed = Arc::new(Mutex::new(Vec::<(usize, i64, i64)>::new()));
    let observed2 = observed.clone();
    let sub_time = sub.time_provider().clone();
    let _subscriber = sub
        .create_data_subscriber(
            "Sub",
            PubSubSpec::new("Lockstep", "text/plain"),
            Some(Box::new(move |ev| {
                let text = String::from_utf8(ev.data.clone()).unwrap();
                let mut parts = text.split_whitespace();
                let k: usize = parts.next().unwrap().parse().unwrap();
                let tick: i64 = parts.next().unwrap().parse().unwrap();
                observed2.lock().unwrap().push((k, tick, sub_time.now_ns()));
            })),
        )
        .unwrap();

    let participants = [&sub, &pub0, &pub1];
    let mut lifecycles = Vec::new();
    let mut time_syncs = Vec::new();
    for p in &participants {
        lifecycles.push(p.create_lifecycle_service(OperationMode::Autonomous).unwrap());
        time_syncs.push(p.create_time_sync_service().unwrap());
    }

    let mut publishers = Vec::new();
    for (k, p) in [&pub0, &pub1].iter().enumerate() {
        publishers.push(
            p.create_data_publisher(
                &format!("Pub{}", k),
                PubSubSpec::new("Lockstep", "text/plain"),
                0,
            )
            .unwrap(),
        );
    }

    // Publishers send one message with their tick in every step.
    for (k, publisher) in publishers.iter().enumerate() {
        let publisher = publisher.clone();
        let lc = lifecycles[k + 1].clone();
        time_syncs[k + 1]
            .set_simulation_step_handler(
                move |now, _| {
                    publisher.publish(format!("{} {}", k, now).as_bytes());
                    if now >= (STEPS - 1) * MS {
                        let _ = lc.stop("done publishing");
                    }
                },
                MS,
            )
            .unwrap();
    }
    {
        let lc = lifecycles[0].clone();
        time_syncs[0]
            .set_simulation_step_handler(
                move |now, _| {
                    if now >= (STEPS - 1) * MS {
                        let _ = lc.stop("done receiving");
                    }
                },
                MS,
            )
            .unwrap();
    }

    // Everyone must see both matching and the other barrier members before
    // the clock starts, otherwise early messages would be lost.
    for publisher in &publishers {
        let link = publisher.descriptor().network_name.clone();
        let conn = if publisher.descriptor().participant_name == "Pub0" {
            pub0.connection().clone()
        } else {
            pub1.connection().clone()
        };
        assert!(
            wait_until(
                || conn.number_of_remote_receivers(MessageKind::DataMessageEvent, &link) == 1,
                Duration::from_secs(5),
            )
            .await,
            "subscriber never matched"
        );
    }
    for ts in &time_syncs {
        let ts = ts.clone();
        assert!(
            wait_until(|| ts.synchronized_participants().len() == 2, Duration::from_secs(5)).await,
            "barrier membership incomplete"
        );
    }

    for lifecycle in &lifecycles {
        lifecycle.start_lifecycle().unwrap();
    }
    for lifecycle in &lifecycles {
        assert_eq!(lifecycle.wait_for_shutdown().await, ParticipantState::Shutdown);
    }
    // The publishers' final messages may still be in flight when their
    // lifecycles finish locally.
    {
        let observed = observed.clone();
        assert!(
            wait_until(
                || observed.lock().unwrap().len() as i64 == 2 * STEPS,
                Duration::from_secs(5)
            )
            .await,
            "not all messages arrived"
        );
    }

    let observed = observed.lock().unwrap().clone();
    // Per-publisher ticks are contiguous multiples of the step duration.
    for k in 0..2usize {
        let ticks: Vec<i64> = observed.iter().filter(|(pk, _, _)| *pk == k).map(|(_, t, _)| *t).collect();
        assert_eq!(ticks.len() as i64, STEPS, "publisher {} message count", k);
        for (i, tick) in ticks.iter().enumerate() {
            assert_eq!(*tick, i as i64 * MS, "publisher {} tick {}", k, i);
        }
    }
    // Lockstep: a message for tick t is observed while the subscriber is at
    // t or one step behind.
    for (k, tick, sub_now) in &observed {
        let diff = tick - sub_now;
        assert!(
            diff == 0 || diff == MS,
            "publisher {} tick {} observed at subscriber time {}",
            k,
            tick,
            sub_now
        );
    }

    sub.disconnect();
    pub0.disconnect();
    pub1.disconnect();
    registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn different_periods_stay_aligned() {
    let (registry, uri) = start_registry().await;
    const SUB_PERIOD: i64 = 7;
    const PUB_PERIODS: [i64; 2] = [3, 17];
    const STEPS_PER_FAST_PUB: i64 = 30;

    let sub = Participant::connect(ParticipantConfiguration::default(), "Sub", &uri).await.unwrap();
    let pub_a = Participant::connect(ParticipantConfiguration::default(), "PubA", &uri).await.unwrap();
    let pub_b = Participant::connect(ParticipantConfiguration::default(), "PubB", &uri).await.unwrap();
    let control =
        Participant::connect(ParticipantConfiguration::default(), "Control", &uri).await.unwrap();

    let observed = Arc::new(Mutex::new(Vec::<(usize, i64, i64, i64)>::new()));
    let observed2 = observed.clone();
    let sub_time = sub.time_provider().clone();
    let _subscriber = sub
        .create_data_subscriber(
            "Sub",
            PubSubSpec::new("Periods", "text/plain"),
            Some(Box::new(move |ev| {
                let text = String::from_utf8(ev.data.clone()).unwrap();
                let mut parts = text.split_whitespace();
                let k: usize = parts.next().unwrap().parse().unwrap();
                let index: i64 = parts.next().unwrap().parse().unwrap();
                observed2.lock().unwrap().push((k, index, ev.timestamp_ns, sub_time.now_ns()));
            })),
        )
        .unwrap();

    // Coordinated lifecycles: the fastest publisher initiates the stop and
    // the rest wind down with it, wherever their step position is.
    let parts = [&sub, &pub_a, &pub_b];
    let mut lifecycles = Vec::new();
    let mut time_syncs = Vec::new();
    for p in &parts {
        lifecycles.push(p.create_lifecycle_service(OperationMode::Coordinated).unwrap());
        time_syncs.push(p.create_time_sync_service().unwrap());
    }
    let controller = control.create_system_controller().unwrap();

    let mut publishers = Vec::new();
    for (k, p) in [&pub_a, &pub_b].iter().enumerate() {
        publishers.push(
            p.create_data_publisher(
                &format!("Pub{}", k),
                PubSubSpec::new("Periods", "text/plain"),
                0,
            )
            .unwrap(),
        );
    }

    for (k, publisher) in publishers.iter().enumerate() {
        let publisher = publisher.clone();
        let counter = Arc::new(AtomicI64::new(0));
        let lc = lifecycles[k + 1].clone();
        let period = PUB_PERIODS[k];
        time_syncs[k + 1]
            .set_simulation_step_handler(
                move |_now, _| {
                    let index = counter.fetch_add(1, Ordering::SeqCst);
                    publisher.publish(format!("{} {}", k, index).as_bytes());
                    if k == 0 && index >= STEPS_PER_FAST_PUB {
                        let _ = lc.stop("enough messages");
                    }
                },
                period,
            )
            .unwrap();
    }
    time_syncs[0].set_simulation_step_handler(|_, _| {}, SUB_PERIOD).unwrap();

    for publisher in &publishers {
        let link = publisher.descriptor().network_name.clone();
        let conn = if publisher.descriptor().participant_name == "PubA" {
            pub_a.connection().clone()
        } else {
            pub_b.connection().clone()
        };
        assert!(
            wait_until(
                || conn.number_of_remote_receivers(MessageKind::DataMessageEvent, &link) == 1,
                Duration::from_secs(5),
            )
            .await
        );
    }
    for ts in &time_syncs {
        let ts = ts.clone();
        assert!(wait_until(|| ts.synchronized_participants().len() == 2, Duration::from_secs(5)).await);
    }

    controller.set_workflow_configuration(vec![
        "Sub".to_string(),
        "PubA".to_string(),
        "PubB".to_string(),
    ]);
    for lifecycle in &lifecycles {
        lifecycle.start_lifecycle().unwrap();
    }
    for lifecycle in &lifecycles {
        assert_eq!(lifecycle.wait_for_shutdown().await, ParticipantState::Shutdown);
    }

    let observed = observed.lock().unwrap().clone();
    assert!(!observed.is_empty());
    for (k, index, sent_time, sub_now) in &observed {
        // Publishers stamp messages with their own virtual step time.
        assert_eq!(*sent_time, index * PUB_PERIODS[*k], "publisher {} message {}", k, index);
        // The barrier keeps senders within one subscriber period.
        assert!(
            (sent_time - sub_now).abs() <= SUB_PERIOD,
            "publisher {} message {} sent at {} observed at subscriber time {}",
            k,
            index,
            sent_time,
            sub_now
        );
    }

    sub.disconnect();
    pub_a.disconnect();
    pub_b.disconnect();
    control.disconnect();
    registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn hard_watchdog_timeout_escalates_to_error() {
    let (registry, uri) = start_registry().await;
    let mut config = ParticipantConfiguration::default();
    config.health_check.soft_response_timeout = Some(20);
    config.health_check.hard_response_timeout = Some(50);

    let p = Participant::connect(config, "Slowpoke", &uri).await.unwrap();
    let lifecycle = p.create_lifecycle_service(OperationMode::Autonomous).unwrap();
    let time_sync = p.create_time_sync_service().unwrap();

    time_sync
        .set_simulation_step_handler(
            move |_, _| {
                std::thread::sleep(Duration::from_millis(300));
            },
            MS,
        )
        .unwrap();

    lifecycle.start_lifecycle().unwrap();
    let lc = lifecycle.clone();
    assert!(
        wait_until(|| lc.state() == ParticipantState::Error, Duration::from_secs(5)).await,
        "hard timeout never escalated, state is {:?}",
        lifecycle.state()
    );

    p.disconnect();
    registry.shutdown();
}

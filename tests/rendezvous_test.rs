//! Registry rendezvous and peer discovery

use simbus::config::ParticipantConfiguration;
use simbus::net::Registry;
use simbus::participant::Participant;
use simbus::{PubSubSpec, SilKitError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn start_registry() -> (Registry, String) {
    let config = ParticipantConfiguration::default();
    let registry = Registry::start(&config, "silkit://127.0.0.1:0").await.unwrap();
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

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_participants_find_each_other() {
    let (registry, uri) = start_registry().await;

    let p1 = Participant::connect(ParticipantConfiguration::default(), "P1", &uri).await.unwrap();
    let p2 = Participant::connect(ParticipantConfiguration::default(), "P2", &uri).await.unwrap();

    assert!(
        wait_until(|| p1.connection().has_peer("P2") && p2.connection().has_peer("P1"), Duration::from_secs(5))
            .await,
        "peers never connected directly"
    );
    assert!(registry.is_connected("default", "P1"));
    assert!(registry.is_connected("default", "P2"));
    assert_eq!(registry.connected_participant_count(), 2);

    p1.disconnect();
    p2.disconnect();
    registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_name_is_rejected_and_first_stays_connected() {
    let (registry, uri) = start_registry().await;

    let p1 = Participant::connect(ParticipantConfiguration::default(), "Twin", &uri).await.unwrap();

    let err = Participant::connect(ParticipantConfiguration::default(), "Twin", &uri)
        .await
        .err()
        .expect("second participant with the same name must be rejected");
    assert!(matches!(err, SilKitError::Protocol(_)), "got {:?}", err);

    // The first holder is untouched and still operational.
    assert!(registry.is_connected("default", "Twin"));
    let publisher = p1.create_data_publisher("Pub1", PubSubSpec::new("T", "m"), 0).unwrap();
    publisher.publish(&[1, 2, 3]);

    p1.disconnect();
    registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_name_in_different_simulations_is_allowed() {
    let (registry, uri) = start_registry().await;

    let mut config_a = ParticipantConfiguration::default();
    config_a.middleware.simulation_name = "simA".to_string();
    let mut config_b = ParticipantConfiguration::default();
    config_b.middleware.simulation_name = "simB".to_string();

    let pa = Participant::connect(config_a, "Twin", &uri).await.unwrap();
    let pb = Participant::connect(config_b, "Twin", &uri).await.unwrap();

    assert!(registry.is_connected("simA", "Twin"));
    assert!(registry.is_connected("simB", "Twin"));
    // Different simulations never mesh.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pa.connection().has_peer("Twin"));

    pa.disconnect();
    pb.disconnect();
    registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_learns_preexisting_services() {
    let (registry, uri) = start_registry().await;

    let p1 = Participant::connect(ParticipantConfiguration::default(), "Early", &uri).await.unwrap();
    let _publisher = p1.create_data_publisher("Pub1", PubSubSpec::new("T", "m"), 0).unwrap();

    // The subscriber joins after the publisher's service already exists; the
    // snapshot replay must still produce a match.
    let p2 = Participant::connect(ParticipantConfiguration::default(), "Late", &uri).await.unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let received2 = received.clone();
    let _subscriber = p2
        .create_data_subscriber(
            "Sub1",
            PubSubSpec::new("T", "m"),
            Some(Box::new(move |_| {
                received2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    let p1c = p1.connection().clone();
    assert!(
        wait_until(
            || p1c.number_of_remote_receivers(
                simbus::wire::message::MessageKind::DataMessageEvent,
                &_publisher.descriptor().network_name,
            ) == 1,
            Duration::from_secs(5),
        )
        .await,
        "late subscriber never matched the pre-existing publisher"
    );

    _publisher.publish(&[42]);
    assert!(
        wait_until(|| received.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await,
        "payload never arrived at the late joiner"
    );

    p1.disconnect();
    p2.disconnect();
    registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_disconnected_fires_when_last_participant_leaves() {
    let (registry, uri) = start_registry().await;
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    registry.set_all_disconnected_handler(move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    });

    let p1 = Participant::connect(ParticipantConfiguration::default(), "Solo", &uri).await.unwrap();
    assert!(wait_until(|| registry.connected_participant_count() == 1, Duration::from_secs(5)).await);

    p1.disconnect();
    assert!(
        wait_until(|| fired.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await,
        "all-disconnected handler never fired"
    );
    registry.shutdown();
}

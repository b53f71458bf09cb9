//! CAN round-trip without time synchronization

use simbus::config::ParticipantConfiguration;
use simbus::net::Registry;
use simbus::participant::Participant;
use simbus::wire::message::MessageKind;
use simbus::CanFrame;
use std::sync::{Arc, Mutex};
use std::time::Duration;

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
async fn ten_frames_arrive_in_order_with_user_context_echo() {
    let registry = Registry::start(&ParticipantConfiguration::default(), "silkit://127.0.0.1:0")
        .await
        .unwrap();
    let uri = registry.listen_uri().to_string();

    let writer = Participant::connect(ParticipantConfiguration::default(), "CanWriter", &uri)
        .await
        .unwrap();
    let reader = Participant::connect(ParticipantConfiguration::default(), "CanReader", &uri)
        .await
        .unwrap();

    let writer_can = writer.create_can_controller("CanController1", "CAN1").unwrap();
    let reader_can = reader.create_can_controller("CanController1", "CAN1").unwrap();

    let received = Arc::new(Mutex::new(Vec::<(u32, Vec<u8>)>::new()));
    let received2 = received.clone();
    reader_can.add_frame_handler(move |ev| {
        received2.lock().unwrap().push((ev.frame.can_id, ev.frame.data.clone()));
    });

    let acks = Arc::new(Mutex::new(Vec::<u64>::new()));
    let acks2 = acks.clone();
    writer_can.add_frame_transmit_handler(move |ack| {
        acks2.lock().unwrap().push(ack.user_context);
    });

    writer_can.start();
    reader_can.start();

    // Wait until the reader's receiver is known before transmitting.
    let writer_conn = writer.connection().clone();
    assert!(
        wait_until(
            || writer_conn.number_of_remote_receivers(MessageKind::CanFrameEvent, "CAN1") == 1,
            Duration::from_secs(5),
        )
        .await,
        "reader never subscribed on CAN1"
    );

    for i in 0..10u32 {
        let data = format!("Test Message {}", i).into_bytes();
        writer_can.send_frame(CanFrame { can_id: i, flags: 0, dlc: 8, data }, (i + 1) as u64);
    }

    assert!(
        wait_until(|| received.lock().unwrap().len() == 10, Duration::from_secs(5)).await,
        "reader did not receive all ten frames"
    );

    let received = received.lock().unwrap().clone();
    for (i, (can_id, data)) in received.iter().enumerate() {
        assert_eq!(*can_id, i as u32, "frames must arrive in send order");
        assert_eq!(data, format!("Test Message {}", i).as_bytes());
    }

    // Each transmit ack echoed the user context that was passed in.
    let acks = acks.lock().unwrap().clone();
    assert_eq!(acks, (1..=10).collect::<Vec<u64>>());

    writer.disconnect();
    reader.disconnect();
    registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn controllers_on_different_networks_stay_isolated() {
    let registry = Registry::start(&ParticipantConfiguration::default(), "silkit://127.0.0.1:0")
        .await
        .unwrap();
    let uri = registry.listen_uri().to_string();

    let a = Participant::connect(ParticipantConfiguration::default(), "A", &uri).await.unwrap();
    let b = Participant::connect(ParticipantConfiguration::default(), "B", &uri).await.unwrap();

    let can_a = a.create_can_controller("Can", "CAN1").unwrap();
    let can_b = b.create_can_controller("Can", "CAN2").unwrap();

    let received = Arc::new(Mutex::new(Vec::<u32>::new()));
    let received2 = received.clone();
    can_b.add_frame_handler(move |ev| {
        received2.lock().unwrap().push(ev.frame.can_id);
    });

    assert!(wait_until(|| a.connection().has_peer("B"), Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    can_a.send_frame(CanFrame { can_id: 1, flags: 0, dlc: 1, data: vec![0xff] }, 0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(received.lock().unwrap().is_empty(), "CAN2 must not see CAN1 traffic");

    a.disconnect();
    b.disconnect();
    registry.shutdown();
}

mod common;

use std::time::Duration;

use blipmqtt::core::packet::{Connect, Packet, QoS};
use blipmqtt::core::session::SessionStatus;
use common::{start_broker, test_config, TestClient};
use tokio::time::sleep;

#[tokio::test]
async fn persistent_session_keeps_subscriptions_and_queue() {
    let broker = start_broker(test_config()).await;
    let (mut sub, ack) = TestClient::connect(broker.addr, "tracker", false).await;
    assert!(!ack.session_present);
    sub.subscribe(1, "fleet/+/gps", QoS::AtLeastOnce).await;
    sub.disconnect().await;
    sleep(Duration::from_millis(100)).await;

    let session = broker.broker.sessions().get("tracker").expect("session kept");
    assert_eq!(session.status(), SessionStatus::DisconnectedRetained);

    let (mut publisher, _) = TestClient::connect(broker.addr, "truck-7", true).await;
    publisher
        .publish("fleet/7/gps", "52.1,4.3", QoS::AtLeastOnce, Some(1))
        .await;
    assert_eq!(publisher.expect().await, Packet::PubAck(1));

    let (mut sub, ack) = TestClient::connect(broker.addr, "tracker", false).await;
    assert!(ack.session_present);
    let queued = sub.expect_publish().await;
    assert_eq!(queued.topic, "fleet/7/gps");
    assert_eq!(queued.qos, QoS::AtLeastOnce);
    sub.send(&Packet::PubAck(queued.packet_id.unwrap())).await;
}

#[tokio::test]
async fn unacknowledged_delivery_is_resent_on_resume() {
    let broker = start_broker(test_config()).await;
    let (mut sub, _) = TestClient::connect(broker.addr, "worker", false).await;
    sub.subscribe(1, "tasks", QoS::AtLeastOnce).await;

    let (mut publisher, _) = TestClient::connect(broker.addr, "pub", true).await;
    publisher.publish("tasks", "resize", QoS::AtLeastOnce, Some(1)).await;
    assert_eq!(publisher.expect().await, Packet::PubAck(1));

    let first = sub.expect_publish().await;
    drop(sub);
    sleep(Duration::from_millis(100)).await;

    let (mut sub, ack) = TestClient::connect(broker.addr, "worker", false).await;
    assert!(ack.session_present);
    let again = sub.expect_publish().await;
    assert!(again.dup);
    assert_eq!(again.packet_id, first.packet_id);
    assert_eq!(&again.payload[..], b"resize");
}

#[tokio::test]
async fn clean_session_discards_previous_state() {
    let broker = start_broker(test_config()).await;
    let (mut sub, _) = TestClient::connect(broker.addr, "kiosk", false).await;
    sub.subscribe(1, "ads/#", QoS::AtMostOnce).await;
    sub.disconnect().await;
    sleep(Duration::from_millis(100)).await;

    let (mut sub, ack) = TestClient::connect(broker.addr, "kiosk", true).await;
    assert!(!ack.session_present);

    let (mut publisher, _) = TestClient::connect(broker.addr, "pub", true).await;
    publisher.publish("ads/banner", "sale", QoS::AtLeastOnce, Some(1)).await;
    assert_eq!(publisher.expect().await, Packet::PubAck(1));
    sub.expect_silence().await;

    sub.disconnect().await;
    sleep(Duration::from_millis(100)).await;
    assert!(broker.broker.sessions().get("kiosk").is_none());
}

#[tokio::test]
async fn second_connection_takes_over_client_id() {
    let broker = start_broker(test_config()).await;
    let (mut first, _) = TestClient::connect(broker.addr, "phone", true).await;
    let (mut second, _) = TestClient::connect(broker.addr, "phone", true).await;
    assert!(first.is_closed().await);

    second.send(&Packet::PingReq).await;
    assert_eq!(second.expect().await, Packet::PingResp);
    assert_eq!(broker.broker.sessions().len(), 1);
}

#[tokio::test]
async fn silent_client_is_dropped_after_keep_alive() {
    let broker = start_broker(test_config()).await;
    let mut connect = Connect::new("sleepy");
    connect.keep_alive = 1;
    let (mut client, _) = TestClient::connect_with(broker.addr, connect).await;
    // 1.5 x keep-alive, plus slack
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn messages_published_while_offline_wait_for_the_client() {
    let broker = start_broker(test_config()).await;
    let (mut sub, _) = TestClient::connect(broker.addr, "logger", false).await;
    sub.subscribe(1, "logs/#", QoS::AtLeastOnce).await;
    drop(sub);
    sleep(Duration::from_millis(100)).await;
    let session = broker.broker.sessions().get("logger").expect("session kept");
    assert_eq!(session.status(), SessionStatus::DisconnectedRetained);

    let (mut publisher, _) = TestClient::connect(broker.addr, "app", true).await;
    publisher.publish("logs/app", "started", QoS::AtLeastOnce, Some(1)).await;
    assert_eq!(publisher.expect().await, Packet::PubAck(1));

    let (mut sub, ack) = TestClient::connect(broker.addr, "logger", false).await;
    assert!(ack.session_present);
    let queued = sub.expect_publish().await;
    assert_eq!(queued.topic, "logs/app");
    assert_eq!(&queued.payload[..], b"started");
    assert_eq!(queued.qos, QoS::AtLeastOnce);
    assert!(!queued.dup);
    sub.send(&Packet::PubAck(queued.packet_id.unwrap())).await;
    sub.expect_silence().await;
}

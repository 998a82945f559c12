mod common;

use blipmqtt::core::packet::{Connect, Packet, QoS, Will};
use common::{start_broker, test_config, TestClient};

fn connect_with_will(client_id: &str, payload: &'static str) -> Connect {
    let mut connect = Connect::new(client_id);
    connect.will = Some(Will {
        topic: "presence/offline".to_string(),
        payload: payload.into(),
        qos: QoS::AtLeastOnce,
        retain: false,
    });
    connect
}

#[tokio::test]
async fn will_is_published_once_on_abrupt_close() {
    let broker = start_broker(test_config()).await;
    let (mut watcher, _) = TestClient::connect(broker.addr, "watcher", true).await;
    watcher.subscribe(1, "presence/#", QoS::AtLeastOnce).await;

    let (device, _) = TestClient::connect_with(broker.addr, connect_with_will("sensor-1", "sensor-1")).await;
    drop(device);

    let will = watcher.expect_publish().await;
    assert_eq!(will.topic, "presence/offline");
    assert_eq!(&will.payload[..], b"sensor-1");
    assert_eq!(will.qos, QoS::AtLeastOnce);
    watcher.send(&Packet::PubAck(will.packet_id.unwrap())).await;
    watcher.expect_silence().await;
}

#[tokio::test]
async fn disconnect_discards_will() {
    let broker = start_broker(test_config()).await;
    let (mut watcher, _) = TestClient::connect(broker.addr, "watcher", true).await;
    watcher.subscribe(1, "presence/#", QoS::AtMostOnce).await;

    let (device, _) = TestClient::connect_with(broker.addr, connect_with_will("sensor-2", "sensor-2")).await;
    device.disconnect().await;
    watcher.expect_silence().await;
}

#[tokio::test]
async fn takeover_publishes_the_evicted_will() {
    let broker = start_broker(test_config()).await;
    let (mut watcher, _) = TestClient::connect(broker.addr, "watcher", true).await;
    watcher.subscribe(1, "presence/#", QoS::AtMostOnce).await;

    let (_old, _) = TestClient::connect_with(broker.addr, connect_with_will("tablet", "old")).await;
    let (_new, _) = TestClient::connect_with(broker.addr, connect_with_will("tablet", "new")).await;

    let will = watcher.expect_publish().await;
    assert_eq!(&will.payload[..], b"old");
    watcher.expect_silence().await;
}

#[tokio::test]
async fn retained_will_is_stored() {
    let broker = start_broker(test_config()).await;
    let mut connect = Connect::new("gateway");
    connect.will = Some(Will {
        topic: "gateways/gateway/state".to_string(),
        payload: "lost".into(),
        qos: QoS::AtMostOnce,
        retain: true,
    });
    let (mut gateway, _) = TestClient::connect_with(broker.addr, connect).await;
    // an unknown packet type ends the connection without DISCONNECT
    gateway.send_raw(&[0xF0, 0x00]).await;
    assert!(gateway.is_closed().await);

    let (mut late, _) = TestClient::connect(broker.addr, "late", true).await;
    late.subscribe(1, "gateways/+/state", QoS::AtMostOnce).await;
    let replayed = late.expect_publish().await;
    assert!(replayed.retain);
    assert_eq!(&replayed.payload[..], b"lost");
}

#[tokio::test]
async fn evicted_will_survives_a_vanishing_successor() {
    let broker = start_broker(test_config()).await;
    let (mut watcher, _) = TestClient::connect(broker.addr, "watcher", true).await;
    watcher.subscribe(1, "presence/#", QoS::AtMostOnce).await;

    let (_old, _) = TestClient::connect_with(broker.addr, connect_with_will("meter", "old")).await;
    // the successor is gone before its CONNACK can be read
    let mut successor = TestClient::open(broker.addr).await;
    successor.send(&Packet::Connect(Connect::new("meter"))).await;
    drop(successor);

    let will = watcher.expect_publish().await;
    assert_eq!(will.topic, "presence/offline");
    assert_eq!(&will.payload[..], b"old");
    watcher.expect_silence().await;
}

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use blipmqtt::broker::Broker;
use blipmqtt::core::packet::{
    encode, try_decode, ConnAck, Connect, Packet, Publish, QoS, Subscribe, SubAck,
};
use blipmqtt::Config;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(3);

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = blipmqtt::logging::init_logging_with("warn");
    });
}

/// Short delays so failure paths finish quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    config.server.connect_timeout_ms = 500;
    config.session.idle_poll_ms = 20;
    config.retry.send_delay_ms = 50;
    config.retry.recv_delay_ms = 50;
    config
}

pub struct TestBroker {
    pub addr: SocketAddr,
    pub broker: Arc<Broker>,
    // dropping the sender stops the accept loop
    _shutdown: watch::Sender<bool>,
}

pub async fn start_broker(config: Config) -> TestBroker {
    init_logging();
    let listener = TcpListener::bind(&config.server.bind_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Broker::new(config);
    let (tx, rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&broker).serve(listener, rx));
    TestBroker {
        addr,
        broker,
        _shutdown: tx,
    }
}

/// A bare MQTT client speaking through the crate's own codec.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    pub async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Opens a socket, sends `connect` and returns the CONNACK.
    pub async fn connect_with(addr: SocketAddr, connect: Connect) -> (Self, ConnAck) {
        let mut client = Self::open(addr).await;
        client.send(&Packet::Connect(connect)).await;
        match client.expect().await {
            Packet::ConnAck(ack) => (client, ack),
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    pub async fn connect(addr: SocketAddr, client_id: &str, clean_session: bool) -> (Self, ConnAck) {
        let mut connect = Connect::new(client_id);
        connect.clean_session = clean_session;
        Self::connect_with(addr, connect).await
    }

    pub async fn send(&mut self, packet: &Packet) {
        let bytes = encode(packet).unwrap();
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next packet within `wait`; `None` on timeout or EOF.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        let read = async {
            loop {
                if let Some(packet) = try_decode(&mut self.buf).unwrap() {
                    return Some(packet);
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        };
        timeout(wait, read).await.ok().flatten()
    }

    pub async fn expect(&mut self) -> Packet {
        self.recv_within(WAIT)
            .await
            .expect("no packet from broker")
    }

    pub async fn expect_publish(&mut self) -> Publish {
        match self.expect().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    /// Asserts nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        if let Some(packet) = self.recv_within(Duration::from_millis(200)).await {
            panic!("unexpected {packet:?}");
        }
    }

    /// Whether the broker closed the socket within `WAIT`.
    pub async fn is_closed(&mut self) -> bool {
        let read = async {
            let mut scratch = [0u8; 64];
            loop {
                match self.stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => return true,
                    Ok(_) => {}
                }
            }
        };
        timeout(WAIT, read).await.unwrap_or(false)
    }

    pub async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![(filter.to_string(), qos)],
        }))
        .await;
        match self.expect().await {
            Packet::SubAck(ack) => ack,
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: &'static str, qos: QoS, packet_id: Option<u16>) {
        let mut publish = Publish::new(topic, payload);
        publish.qos = qos;
        publish.packet_id = packet_id;
        self.send(&Packet::Publish(publish)).await;
    }

    pub async fn disconnect(mut self) {
        self.send(&Packet::Disconnect).await;
    }
}

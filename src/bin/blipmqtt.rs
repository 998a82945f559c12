//! blipmqtt – one binary that can start the broker *or* act as an
//! interactive MQTT client shell.
//
//  $ blipmqtt start --config blipmqtt.toml
//  $ blipmqtt connect 127.0.0.1:1883
//  > sub chat/# 1
//  > pub chat/general hello
//  [chat/general qos=1] hello
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use blipmqtt::broker::Retrier;
use blipmqtt::config::DEFAULT_CONFIG_PATH;
use blipmqtt::core::packet::{
    encode, try_decode, Connect, ConnectReturnCode, Packet, Publish, QoS, Subscribe, Unsubscribe,
};
use blipmqtt::logging::init_logging;
use blipmqtt::{start_broker, Config};

use bytes::BytesMut;
use clap::{Parser, Subcommand};
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "blipmqtt", version, about = "blipmqtt MQTT broker & shell")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the broker daemon.
    Start {
        /// Path to config TOML (env BLIPMQTT_CONFIG is used when omitted)
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Connect to a running broker in interactive mode.
    Connect {
        /// Broker address (host:port)
        addr: SocketAddr,
        /// Client identifier; generated when omitted
        #[arg(long)]
        client_id: Option<String>,
        /// Keep subscriptions across reconnects (clean_session = 0)
        #[arg(long)]
        persistent: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start { config } => {
            let path = config.or_else(|| {
                Path::new(DEFAULT_CONFIG_PATH)
                    .exists()
                    .then(|| DEFAULT_CONFIG_PATH.to_string())
            });
            let cfg: Config = Config::load(path.as_deref())?;
            info!("starting blipmqtt on {}", cfg.server.bind_addr);
            start_broker(cfg).await?;
        }
        Command::Connect {
            addr,
            client_id,
            persistent,
        } => repl(addr, client_id, persistent).await?,
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────
// Interactive REPL shell
// ───────────────────────────────────────────────────────────
const KEEP_ALIVE_SECS: u16 = 60;

struct PacketIdCounter(AtomicU16);

impl PacketIdCounter {
    fn next(&self) -> u16 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

async fn repl(addr: SocketAddr, client_id: Option<String>, persistent: bool) -> anyhow::Result<()> {
    let mut rl: Editor<(), DefaultHistory> = DefaultEditor::new()?;

    let stream = Retrier::for_send()
        .attempt(|| async { TcpStream::connect(addr).await.ok() })
        .await
        .ok_or_else(|| anyhow::anyhow!("could not connect to {addr}"))?;
    stream.set_nodelay(true)?;
    let (mut r, mut w) = stream.into_split();

    let mut connect = Connect::new(client_id.unwrap_or_default());
    connect.clean_session = !persistent;
    connect.keep_alive = KEEP_ALIVE_SECS;
    w.write_all(&encode(&Packet::Connect(connect))?).await?;

    let mut buf = BytesMut::with_capacity(4096);
    match read_packet(&mut r, &mut buf).await? {
        Some(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Accepted => {
            println!(
                "Connected to {addr} (session present: {}). Type `help` for commands.",
                ack.session_present
            );
        }
        Some(Packet::ConnAck(ack)) => anyhow::bail!("connection refused: {}", ack.code),
        other => anyhow::bail!("expected CONNACK, got {other:?}"),
    }

    // Single writer: the REPL, the printer and the pinger all go through it.
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    let writer: JoinHandle<anyhow::Result<()>> = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let is_disconnect = matches!(packet, Packet::Disconnect);
            w.write_all(&encode(&packet)?).await?;
            w.flush().await?;
            if is_disconnect {
                break;
            }
        }
        Ok(())
    });

    let acks = tx.clone();
    let printer: JoinHandle<()> = tokio::spawn(async move {
        while let Ok(Some(packet)) = read_packet(&mut r, &mut buf).await {
            let reply = match packet {
                Packet::Publish(publish) => {
                    println!(
                        "[{} qos={}{}] {}",
                        publish.topic,
                        u8::from(publish.qos),
                        if publish.retain { " retained" } else { "" },
                        String::from_utf8_lossy(&publish.payload)
                    );
                    match (publish.qos, publish.packet_id) {
                        (QoS::AtLeastOnce, Some(id)) => Some(Packet::PubAck(id)),
                        (QoS::ExactlyOnce, Some(id)) => Some(Packet::PubRec(id)),
                        _ => None,
                    }
                }
                Packet::PubRel(id) => Some(Packet::PubComp(id)),
                Packet::PubRec(id) => Some(Packet::PubRel(id)),
                Packet::PingResp => None,
                other => {
                    println!("< {other}");
                    None
                }
            };
            if let Some(reply) = reply {
                if acks.send(reply).is_err() {
                    break;
                }
            }
        }
        println!("connection closed by broker");
    });

    let pings = tx.clone();
    let pinger = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(u64::from(KEEP_ALIVE_SECS) / 2));
        tick.tick().await;
        loop {
            tick.tick().await;
            if pings.send(Packet::PingReq).is_err() {
                break;
            }
        }
    });

    let ids = PacketIdCounter(AtomicU16::new(1));
    loop {
        let Ok(line) = rl.readline("> ") else { break };
        let _ = rl.add_history_entry(line.as_str());

        let packet = match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["help"] => {
                println!(
                    "pub|pub1|pub2 <topic> <msg> | retain <topic> <msg> | sub <filter> [qos] | unsub <filter> | exit"
                );
                continue;
            }
            ["exit" | "quit"] => break,
            [cmd @ ("pub" | "pub1" | "pub2" | "retain"), topic, rest @ ..] => {
                let mut publish = Publish::new(*topic, rest.join(" "));
                publish.qos = match *cmd {
                    "pub1" => QoS::AtLeastOnce,
                    "pub2" => QoS::ExactlyOnce,
                    _ => QoS::AtMostOnce,
                };
                publish.retain = *cmd == "retain";
                if publish.qos != QoS::AtMostOnce {
                    publish.packet_id = Some(ids.next());
                }
                Packet::Publish(publish)
            }
            ["sub", filter, qos @ ..] => {
                let qos = match qos.first().map(|q| q.parse::<u8>()) {
                    None => QoS::AtMostOnce,
                    Some(Ok(level)) => match QoS::try_from(level) {
                        Ok(qos) => qos,
                        Err(e) => {
                            println!("{e}");
                            continue;
                        }
                    },
                    Some(Err(_)) => {
                        println!("QoS must be 0, 1 or 2");
                        continue;
                    }
                };
                Packet::Subscribe(Subscribe {
                    packet_id: ids.next(),
                    filters: vec![((*filter).to_string(), qos)],
                })
            }
            ["unsub", filter] => Packet::Unsubscribe(Unsubscribe {
                packet_id: ids.next(),
                filters: vec![(*filter).to_string()],
            }),
            [] => continue,
            _ => {
                println!("Unknown cmd. Type `help`.");
                continue;
            }
        };
        if tx.send(packet).is_err() {
            break;
        }
    }

    let _ = tx.send(Packet::Disconnect);
    drop(tx);
    pinger.abort();
    if let Ok(Err(e)) = writer.await {
        println!("write failed: {e}");
    }
    printer.abort();
    Ok(())
}

/// Reads until one whole packet is buffered. `Ok(None)` on EOF.
async fn read_packet(r: &mut OwnedReadHalf, buf: &mut BytesMut) -> anyhow::Result<Option<Packet>> {
    loop {
        if let Some(packet) = try_decode(buf)? {
            return Ok(Some(packet));
        }
        if r.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

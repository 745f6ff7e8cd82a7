use clap::Parser;
use client::game::ClientSession;
use client::input::BotDriver;
use client::network::{NetworkClient, NetworkEvent};
use client::ClientConfig;
use log::{debug, info};
use shared::{timestamp_millis, Appearance, WireFormat};
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server URL to connect to
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Name shown to other players
    #[arg(short = 'u', long, default_value = "bot")]
    username: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Use bincode frames instead of JSON
    #[arg(short = 'b', long)]
    binary: bool,

    /// Seed for the wandering bot
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Stop after this many seconds (runs until Ctrl+C when omitted)
    #[arg(short = 'd', long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting headless client...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let config = ClientConfig {
        fake_latency_ms: args.fake_ping,
        ..ClientConfig::default()
    };
    let format = if args.binary {
        WireFormat::Binary
    } else {
        WireFormat::Json
    };

    let mut network = NetworkClient::spawn(args.server.as_str(), &config, format);
    let mut session = ClientSession::new(config, args.username.as_str(), Appearance::default());
    let mut bot = BotDriver::new(args.seed);

    let dt = 1.0 / 60.0;
    let mut frame_interval = interval(Duration::from_secs_f32(dt));
    frame_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats_interval = interval(Duration::from_secs(5));
    let started = Instant::now();
    let deadline = args.duration.map(Duration::from_secs);

    loop {
        tokio::select! {
            _ = frame_interval.tick() => {
                let now = timestamp_millis();
                for event in network.poll_events() {
                    match event {
                        NetworkEvent::Connected => {
                            let handshake = session.on_connected();
                            if let Err(e) = network.send(handshake) {
                                debug!("Handshake not sent: {}", e);
                            }
                        }
                        NetworkEvent::Packet(packet) => session.handle_packet(packet, now),
                        NetworkEvent::Disconnected { reason } => session.on_disconnected(&reason),
                    }
                }

                let intent = bot.next_intent(dt, session.vehicle_id().is_some());
                for packet in session.frame(&intent, dt, now) {
                    // Dropped while reconnecting.
                    let _ = network.send(packet);
                }
            }
            _ = stats_interval.tick() => {
                if let Some(prediction) = session.prediction() {
                    let stats = prediction.stats();
                    info!(
                        "ack {} | pending {} | corrections: {} ignored, {} smoothed, {} snapped | latency {:.0}ms | {} remote entities | {} chunks",
                        prediction.last_ack(),
                        prediction.pending(),
                        stats.ignored,
                        stats.smoothed,
                        stats.snapped,
                        session.clock().latency_ms(),
                        session.interpolator().len(),
                        session.chunks().loaded_count(),
                    );
                } else {
                    info!("Waiting for server ({:?})", network.status());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }

        if deadline.map_or(false, |d| started.elapsed() >= d) {
            info!("Run time elapsed, shutting down");
            break;
        }
    }

    if session.is_playing() {
        let _ = network.send(shared::ClientPacket::Disconnect);
    }
    network.shutdown().await;

    Ok(())
}

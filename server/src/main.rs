use clap::Parser;
use log::{error, info};
use server::network::Server;
use server::relay::RelayServer;
use server::{ServerConfig, ServerMode};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the WebSocket listener to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Authoritative physics server or room relay
    #[arg(short, long, value_enum, default_value = "authoritative")]
    mode: ServerMode,

    /// Simulation ticks per second
    #[arg(short, long, default_value_t = shared::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    /// Maximum concurrent connections
    #[arg(long, default_value = "32")]
    max_clients: usize,

    /// World seed
    #[arg(long, default_value = "12345")]
    seed: u32,

    /// Chebyshev radius of simulated chunks around each player
    #[arg(long, default_value = "2")]
    physics_radius: i32,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Do not park a vehicle fleet near the spawn point
    #[arg(long)]
    no_vehicles: bool,
}

impl Args {
    fn config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let bind_addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;
        Ok(ServerConfig {
            bind_addr,
            mode: self.mode,
            tick_rate: self.tick_rate,
            max_clients: self.max_clients,
            client_timeout: Duration::from_secs(self.timeout),
            seed: self.seed,
            physics_radius: self.physics_radius,
            spawn_vehicles: !self.no_vehicles,
            ..ServerConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = args.config()?;
    config.validate()?;

    match config.mode {
        ServerMode::Authoritative => {
            info!(
                "Starting authoritative server (seed {}, {} Hz)",
                config.seed, config.tick_rate
            );
            let mut server = match Server::new(config).await {
                Ok(server) => server,
                Err(e) => {
                    error!("Server failed to start: {}", e);
                    return Err(e.into());
                }
            };
            let shutdown = server.shutdown_handle();
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    shutdown.shutdown();
                }
            }
        }
        ServerMode::Relay => {
            info!("Starting relay");
            let mut relay = RelayServer::new(&config).await?;
            let shutdown = relay.shutdown_handle();
            tokio::select! {
                result = relay.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    shutdown.shutdown();
                }
            }
        }
    }

    Ok(())
}

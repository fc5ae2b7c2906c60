use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing::info;

use roomcast::auth::Users;
use roomcast::config::{AuthMode, Config};
use roomcast::ip::{self, StaticProvider};
use roomcast::{relay, server};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Screen sharing signaling server with an embedded TURN relay.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Signaling bind address.
    #[arg(long, default_value = ":5050")]
    server_address: String,

    /// TURN bind address.
    #[arg(long, default_value = ":3478")]
    turn_address: String,

    /// Relay port range as min:max (span of at least 40). Unrestricted when
    /// omitted.
    #[arg(long)]
    turn_port_range: Option<String>,

    /// TURN realm.
    #[arg(long, default_value = "roomcast")]
    turn_realm: String,

    /// Room creation policy: none, all, or turn.
    #[arg(long, default_value = "turn")]
    auth_mode: AuthMode,

    /// Externally reachable IP, at most one per family. Autodetected from
    /// the network interfaces when omitted.
    #[arg(long = "external-ip")]
    external_ip: Vec<String>,

    /// Regex allow-list for the Origin header.
    #[arg(long = "cors-allowed-origin")]
    cors_allowed_origins: Vec<String>,

    /// Users file with `user:password` lines; `#` starts a comment.
    #[arg(long)]
    users_file: Option<PathBuf>,

    /// Close the room when its owner disconnects.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    close_room_when_owner_leaves: bool,
}

#[tokio::main]
async fn main() -> Result<(), roomcast::BoxError> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let external = if cli.external_ip.is_empty() {
        vec![ip::detect_external_ip()?.to_string()]
    } else {
        cli.external_ip.clone()
    };
    let ips = Arc::new(StaticProvider::parse(&external)?);

    let config = Config {
        server_address: cli.server_address,
        turn_port: Config::port_of(&cli.turn_address)?,
        turn_address: cli.turn_address,
        turn_port_range: cli
            .turn_port_range
            .as_deref()
            .map(Config::parse_port_range)
            .transpose()?,
        turn_realm: cli.turn_realm,
        auth_mode: cli.auth_mode,
        cors_allowed_origins: Config::compile_origins(&cli.cors_allowed_origins)?,
        close_room_when_owner_leaves: cli.close_room_when_owner_leaves,
    };

    let users = match &cli.users_file {
        Some(path) => Users::load(path)?,
        None => Users::empty(),
    };

    let (store, turn_server) = relay::start(&config, ips.clone()).await?;

    tokio::select! {
        result = server::run_server(config, Arc::new(users), store, ips) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    turn_server.close().await?;
    Ok(())
}

use std::net::{Ipv4Addr, SocketAddr};
use std::process;

use clap::{CommandFactory, Parser, Subcommand};
use log::{error, info};
use tokio::runtime::{Builder, Runtime};

use rooms::client;
use rooms::config::{ClientConfig, ServerConfig};
use rooms::error::{ConfigError, ServerError};
use rooms::logging;
use rooms::server::Server;

/// A chat room server and its terminal client.
#[derive(Parser)]
#[command(name = "rooms", author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Start a server.
    Host {
        /// Port to listen on (1024-49151, default 9034).
        port: Option<String>,
    },
    /// Join a server as <username>.
    Join {
        /// 1 to 12 bytes.
        username: String,
        /// IPv4 or IPv6 address of the server.
        ip: String,
        /// Server port (default 9034).
        port: Option<String>,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            process::exit(code);
        }
    };

    let code = match cli.mode {
        Mode::Host { port } => host(port.as_deref()),
        Mode::Join { username, ip, port } => join(&username, &ip, port.as_deref()),
    };
    process::exit(code);
}

fn usage(err: ConfigError) -> i32 {
    eprintln!("error: {}", err);
    eprintln!("{}", Cli::command().render_usage());
    1
}

fn runtime(builder: &mut Builder) -> Option<Runtime> {
    match builder.enable_all().build() {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            eprintln!("rooms: couldn't start the runtime: {}", err);
            None
        }
    }
}

async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let server = Server::bind(addr, config, None).await?;
    tokio::select! {
        served = server.run() => served,
        _ = tokio::signal::ctrl_c() => {
            info!("server: interrupted, shutting down");
            Ok(())
        }
    }
}

fn host(port: Option<&str>) -> i32 {
    let config = match ServerConfig::from_args(port) {
        Ok(config) => config,
        Err(err) => return usage(err),
    };
    logging::init_server();

    let runtime = match runtime(&mut Builder::new_current_thread()) {
        Some(runtime) => runtime,
        None => return 1,
    };
    match runtime.block_on(serve(config)) {
        Ok(()) => 0,
        Err(err) => {
            error!("server: {}", err);
            1
        }
    }
}

fn join(username: &str, ip: &str, port: Option<&str>) -> i32 {
    let config = match ClientConfig::from_args(username, ip, port) {
        Ok(config) => config,
        Err(err) => return usage(err),
    };
    logging::init_client(&config.username);

    let runtime = match runtime(&mut Builder::new_multi_thread()) {
        Some(runtime) => runtime,
        None => return 1,
    };
    let joined = runtime.block_on(client::run(config, tokio::io::stdin(), tokio::io::stdout()));
    // Stdin is read on a blocking thread that can't be interrupted.
    runtime.shutdown_background();

    match joined {
        Ok(()) => 0,
        Err(err) => {
            error!("client: {}", err);
            eprintln!("rooms: {}", err);
            1
        }
    }
}

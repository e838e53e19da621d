//! Command-line interface for rutunnel

use crate::agent::Agent;
use crate::client::Client;
use crate::pump::pump;
use crate::server::TunnelServer;
use crate::version::{platform, VERSION};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use url::Url;

/// CLI represents the command-line interface for rutunnel
pub struct CLI {
    app: App,
}

/// Reverse TCP tunnel over WebSocket
#[derive(Parser)]
#[clap(version = VERSION, about = "Reverse TCP tunnel over WebSocket")]
struct App {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the version number
    Version,

    /// Start the tunnel server
    Server {
        /// Listen address for incoming WebSocket channels
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,

        /// Listen port for incoming WebSocket channels
        #[clap(short = 'p', long, default_value = "8765")]
        port: u16,

        /// Show debug logs (use -dd for trace logs)
        #[clap(short = 'd', long, action = clap::ArgAction::Count)]
        debug: u8,
    },

    /// Start an agent that calls home to the tunnel server
    Agent {
        /// WebSocket address of the tunnel server
        #[clap(short = 'u', long, default_value = "ws://localhost:8765")]
        url: String,

        /// Show debug logs (use -dd for trace logs)
        #[clap(short = 'd', long, action = clap::ArgAction::Count)]
        debug: u8,
    },

    /// Forward a local port to a target reachable by an agent
    Connect {
        /// WebSocket address of the tunnel server
        #[clap(short = 'u', long, default_value = "ws://localhost:8765")]
        url: String,

        /// Local listen address
        #[clap(short = 'l', long, default_value = "127.0.0.1:9870")]
        listen: String,

        /// Target address the agent should dial (host:port)
        #[clap(short = 't', long)]
        target: String,

        /// Show debug logs (use -dd for trace logs)
        #[clap(short = 'd', long, action = clap::ArgAction::Count)]
        debug: u8,
    },
}

impl CLI {
    /// Creates a new CLI instance
    pub fn new() -> Self {
        CLI { app: App::parse() }
    }

    /// Executes the CLI application
    pub fn execute(&self) -> Result<(), Box<dyn Error>> {
        match &self.app.command {
            Commands::Version => {
                println!("rutunnel version {} {}", VERSION, platform());
                Ok(())
            }
            Commands::Server { host, port, debug } => {
                self.init_logging(*debug);
                self.run_server(host, *port)
            }
            Commands::Agent { url, debug } => {
                self.init_logging(*debug);
                self.check_ws_url(url)?;
                self.run_agent(url)
            }
            Commands::Connect {
                url,
                listen,
                target,
                debug,
            } => {
                self.init_logging(*debug);
                self.check_ws_url(url)?;
                self.run_connect(url, listen, target)
            }
        }
    }

    /// Initialize logging with appropriate level
    fn init_logging(&self, debug_level: u8) {
        let level = match debug_level {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        env_logger::Builder::new()
            .format_timestamp_millis()
            .filter_level(level)
            .init();
    }

    /// Validate a WebSocket endpoint address
    fn check_ws_url(&self, url: &str) -> Result<(), Box<dyn Error>> {
        let parsed = Url::parse(url)?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(()),
            other => Err(format!("unsupported URL scheme: {}", other).into()),
        }
    }

    /// Run the tunnel server until interrupted
    #[tokio::main]
    async fn run_server(&self, host: &str, port: u16) -> Result<(), Box<dyn Error>> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("tunnel server listening on {}:{}", host, port);

        let server = Arc::new(TunnelServer::new());

        let accept_loop = {
            let server = Arc::clone(&server);
            async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                match tokio_tungstenite::accept_async(stream).await {
                                    Ok(ws) => server.on_connection(ws).await,
                                    Err(err) => {
                                        error!("websocket handshake with {} failed: {}", addr, err)
                                    }
                                }
                            });
                        }
                        Err(err) => error!("accept failed: {}", err),
                    }
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = signal::ctrl_c() => info!("shutting down"),
        }

        server.close_all().await;
        Ok(())
    }

    /// Run an agent until interrupted
    #[tokio::main]
    async fn run_agent(&self, url: &str) -> Result<(), Box<dyn Error>> {
        let agent = Agent::new();
        info!("agent {} calling home to {}", agent.id, url);

        tokio::select! {
            _ = agent.run(url) => {}
            _ = signal::ctrl_c() => info!("shutting down"),
        }

        Ok(())
    }

    /// Run a local forwarder that tunnels every connection through the server
    #[tokio::main]
    async fn run_connect(&self, url: &str, listen: &str, target: &str) -> Result<(), Box<dyn Error>> {
        let listener = TcpListener::bind(listen).await?;
        info!("forwarding {} to {} via {}", listen, target, url);

        let client = Arc::new(Client::new(url));
        let target = target.to_string();

        let accept_loop = async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let client = Arc::clone(&client);
                        let target = target.clone();
                        tokio::spawn(async move {
                            match client.dial("tcp", &target).await {
                                Ok(session) => pump(session, stream).await,
                                Err(err) => error!("dial for {} failed: {}", addr, err),
                            }
                        });
                    }
                    Err(err) => error!("accept failed: {}", err),
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = signal::ctrl_c() => info!("shutting down"),
        }

        Ok(())
    }
}

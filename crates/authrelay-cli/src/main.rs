//! Authentication Relay CLI
//!
//! Runs one of the three parties of the relay: a client that asks the primary
//! server to relay a `who_am_i`, the primary server that relays it while
//! acting as the caller, and the delegated host that answers it.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use authrelay_core::auth::{create_provider, Credential};
use authrelay_core::config::{
    LoggingConfig, RelayConfig, UserCredential, DEFAULT_DELEGATED_PORT, DEFAULT_PRIMARY_PORT,
    DELEGATED_PORT_OFFSET,
};
use authrelay_core::error::RelayError;
use authrelay_core::handlers::{DelegationRelay, RelayHandler, RequestHandler, WhoAmIHandler};
use authrelay_core::metrics::RelayMetrics;
use authrelay_core::network::{ConnectOptions, Connection, Listener};
use authrelay_core::protocol::Message;

/// Delegating authentication relay.
#[derive(Parser)]
#[command(name = "authrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask the primary server who we are, relayed through the delegated host.
    Client {
        /// Primary server host.
        #[arg(default_value = "localhost")]
        host: String,

        /// Primary server port.
        #[arg(default_value_t = DEFAULT_PRIMARY_PORT)]
        port: u16,

        /// Delegated host the primary relays to (defaults to `host`).
        delegated_host: Option<String>,

        /// Delegated host port (defaults to `port` + 100).
        delegated_port: Option<u16>,

        /// Identity to assert instead of relaying the caller.
        delegation_token: Option<String>,

        /// Number of requests to send; 0 keeps going until interrupted.
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u64,
    },
    /// Run the primary server, relaying to delegated hosts as the caller.
    Server {
        /// Port to listen on.
        #[arg(default_value_t = DEFAULT_PRIMARY_PORT)]
        port: u16,

        #[command(flatten)]
        identity: ServiceIdentity,
    },
    /// Run the delegated host, answering `who_am_i` with the observed caller.
    Delegated {
        /// Port to listen on.
        #[arg(default_value_t = DEFAULT_DELEGATED_PORT)]
        port: u16,

        #[command(flatten)]
        identity: ServiceIdentity,
    },
}

/// Optional service identity overriding `security.service`.
#[derive(Args)]
struct ServiceIdentity {
    username: Option<String>,
    password: Option<String>,
    domain: Option<String>,
}

impl ServiceIdentity {
    fn apply(self, config: &mut RelayConfig) {
        let (Some(username), Some(password)) = (self.username, self.password) else {
            return;
        };
        let mut service = UserCredential::new(username, password);
        if let Some(domain) = self.domain.filter(|d| !d.trim().is_empty()) {
            service = service.with_domain(domain);
        }
        info!(service = %service.principal_name(), "using service identity from arguments");
        config.security.service = Some(service);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };

    // Override log level from verbosity flag
    let log_config = match cli.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    // Setup tracing
    setup_tracing(&log_config);

    // Run the async runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.command {
            Command::Client {
                host,
                port,
                delegated_host,
                delegated_port,
                delegation_token,
                count,
            } => {
                let target = RelayTarget {
                    delegated_host: delegated_host.unwrap_or_else(|| host.clone()),
                    delegated_port: delegated_port
                        .unwrap_or_else(|| port.saturating_add(DELEGATED_PORT_OFFSET)),
                    delegation_token,
                };
                run_client(config, &host, port, target, count).await
            }
            Command::Server { port, identity } => {
                let mut config = config;
                config.listen.set_port(port)?;
                identity.apply(&mut config);
                run_server(config, Role::Primary).await
            }
            Command::Delegated { port, identity } => {
                let mut config = config;
                config.listen.set_port(port)?;
                identity.apply(&mut config);
                run_server(config, Role::Delegated).await
            }
        }
    })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

/// Where the primary should relay each request.
struct RelayTarget {
    delegated_host: String,
    delegated_port: u16,
    delegation_token: Option<String>,
}

impl RelayTarget {
    fn message(&self) -> Message {
        let message =
            Message::who_am_i().with_delegate(self.delegated_host.clone(), self.delegated_port);
        match &self.delegation_token {
            Some(token) => message.with_delegation_token(token.clone()),
            None => message,
        }
    }
}

/// Send `count` relayed requests, reconnecting whenever the server drops us.
async fn run_client(
    config: RelayConfig,
    host: &str,
    port: u16,
    target: RelayTarget,
    count: u64,
) -> anyhow::Result<()> {
    let provider = create_provider(&config.security)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %format!("{host}:{port}"),
        delegated = %format!("{}:{}", target.delegated_host, target.delegated_port),
        delegation_token = target.delegation_token.is_some(),
        "starting relay client"
    );

    let mut connection: Option<Connection> = None;
    let mut sent = 0u64;

    let work = async {
        while count == 0 || sent < count {
            if connection.is_none() {
                let options =
                    ConnectOptions::authenticated(Arc::clone(&provider), Credential::Current)
                        .with_config(config.connection.clone());
                connection = Some(Connection::connect(host, port, options).await?);
            }
            let Some(client) = connection.as_mut() else {
                continue;
            };

            match client.request(target.message()).await {
                Ok(reply) => {
                    sent += 1;
                    println!(
                        "[{sent}] identity: {}",
                        reply.data_text().unwrap_or_default()
                    );
                }
                Err(RelayError::Remote { message }) => {
                    sent += 1;
                    warn!(error = %message, "server reported a fault");
                }
                Err(e) if e.is_disconnect() => {
                    warn!(error = %e, "disconnected, reconnecting");
                    connection = None;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(anyhow::Error::from(e)),
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    let result = tokio::select! {
        result = work => result,
        () = shutdown_signal() => {
            info!("shutdown signal received, stopping client");
            Ok(())
        }
    };

    if let Some(mut client) = connection {
        client.stop().await?;
    }
    info!(requests = sent, "client finished");
    result
}

/// Which server this process runs.
#[derive(Debug, Clone, Copy)]
enum Role {
    Primary,
    Delegated,
}

async fn run_server(config: RelayConfig, role: Role) -> anyhow::Result<()> {
    let metrics = Arc::new(RelayMetrics::new());
    let provider = create_provider(&config.security)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        role = ?role,
        listen = %config.listen.address,
        mechanism = config.security.mechanism.mechanism_name(),
        service = ?config.security.service.as_ref().map(UserCredential::principal_name),
        "starting relay server"
    );

    let handler: Arc<dyn RequestHandler> = match role {
        Role::Primary => {
            let relay = DelegationRelay::new(Arc::clone(&provider), config.connection.clone())
                .with_metrics(Arc::clone(&metrics));
            Arc::new(RelayHandler::new(relay))
        }
        Role::Delegated => Arc::new(WhoAmIHandler::new()),
    };

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_clone = Arc::clone(&metrics);
        let metrics_addr = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics_clone).await {
                error!(error = %e, "metrics server error");
            }
        });
        info!(address = %config.metrics.address, "metrics server started");
    }

    let listener = Listener::new(&config, provider, handler)?.with_metrics(metrics);
    let shutdown_handle = listener.shutdown_handle();

    // Handle shutdown signals
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping server");
        let _ = shutdown_handle.send(());
    });

    listener.run().await?;

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<RelayMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    if req.uri().path() != "/metrics" {
                        let mut response = Response::new(Full::new(Bytes::from_static(b"not found")));
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        return Ok::<_, hyper::Error>(response);
                    }
                    let body = metrics.encode().unwrap_or_default();
                    Ok(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}

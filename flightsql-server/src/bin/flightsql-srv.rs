use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arrow_flight::flight_service_server::FlightServiceServer;
use clap::Parser;
use flightsql_server::backend::datafusion::DataFusionBackend;
use flightsql_server::dispatcher::FlightSqlDispatcher;
use tonic::transport::Server;
use tracing::info;

/// Flight SQL protocol engine reference server.
///
/// Authentication, TLS, and cluster coordination are transport concerns
/// out of scope for this engine; front it with a gateway if you need
/// them.
#[derive(Parser, Debug)]
#[command(name = "flightsql-srv")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "FLIGHTSQL_LISTEN", default_value = "0.0.0.0:50051")]
    listen: String,

    /// Idle expiry, in seconds, for cached prepared statements.
    #[arg(long, env = "FLIGHTSQL_IDLE_EXPIRY_SECS", default_value_t = 600)]
    idle_expiry_secs: u64,

    /// Maximum number of concurrently cached prepared statements.
    #[arg(long, env = "FLIGHTSQL_PREPARED_STATEMENT_CAPACITY", default_value_t = 100)]
    prepared_statement_capacity: u64,

    /// Reserved for a future non-reference backend; the bundled
    /// DataFusion backend ignores this and serves its fixed fixture.
    #[arg(long, env = "FLIGHTSQL_BACKEND_CONNECTION_STRING")]
    backend_connection_string: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Some(connection_string) = &args.backend_connection_string {
        info!(connection_string, "backend-connection-string set but the reference backend is fixed; ignoring");
    }

    let backend = Arc::new(DataFusionBackend::new());
    let dispatcher = FlightSqlDispatcher::new(
        backend,
        args.prepared_statement_capacity,
        Duration::from_secs(args.idle_expiry_secs),
    );
    let svc = FlightServiceServer::new(dispatcher);

    let addr = args
        .listen
        .parse()
        .with_context(|| format!("parsing listen address {}", args.listen))?;
    info!(%addr, "listening");
    Server::builder().add_service(svc).serve(addr).await?;
    info!("bye");
    Ok(())
}

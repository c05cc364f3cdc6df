use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt};

use aleph_broker::broker::{Session, SessionClock, Simulation};
use aleph_broker::core::Config;
use aleph_broker::net::NetServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize logger
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,aleph_broker=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("🦀 aleph-broker starting (replay simulation)...");

    // 2. Load config: explicit path or the default locations
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::load_default(),
    };

    // 3. Build the simulated broker and its session clock
    let clock = SessionClock::from_config(&config.session)?;
    let sim = Simulation::from_config(&config)?;
    let session = Session::new(sim, clock);

    // 4. Serve one agent for the whole session
    let server = NetServer::bind(config.server.listen.as_str(), config.server.secret.clone()).await?;
    tracing::info!(
        "📡 waiting for agent on {} (session {}-{}, {}s ticks)",
        server.local_addr()?,
        config.session.open,
        config.session.close,
        config.session.tick_secs
    );

    let session = server.run(session).await?;
    tracing::info!("✅ session complete after {} tick(s)", session.tick().saturating_sub(1));
    Ok(())
}

//! Minimal agent: logs every state block and flattens the book on the last
//! tick before the close.

use tracing_subscriber::{EnvFilter, fmt};

use aleph_broker::Request;
use aleph_broker::broker::SessionClock;
use aleph_broker::core::Config;
use aleph_broker::net::NetClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = Config::load_default();
    let clock = SessionClock::from_config(&config.session)?;
    let addr = std::env::args().nth(1).unwrap_or_else(|| config.server.listen.clone());

    let mut client = NetClient::connect(addr.as_str(), &config.server.secret).await?;
    tracing::info!("🔌 connected to {}", addr);

    while let Some(state) = client.recv_state().await? {
        let eval = state.evaluate();
        tracing::info!(
            "tick {} | cash {} | staged buy {} | holdings {} | staged sell {} | total {}",
            state.tick(),
            eval.cash,
            eval.staged_buy,
            eval.holdings,
            eval.staged_sell,
            eval.total()
        );

        let last = clock.boundary(state.tick() + 1) > clock.close;
        let requests = if last {
            tracing::info!("🏁 last tick, flattening");
            vec![Request::cancel_all(), Request::sell_all()]
        } else {
            vec![]
        };
        client.send_requests(&requests).await?;
    }

    tracing::info!("👋 server closed the session");
    Ok(())
}

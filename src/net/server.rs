//! Agent gateway: one TCP client, one request/response pair per tick.
//!
//! The client's first line must be the shared secret. After that the server
//! sends a `/*`..`*/` state block every tick and reads request lines until an
//! empty line. At session end the connection is closed.

use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{error, info, warn};

use crate::broker::{Broker, Session, TickStatus};
use crate::core::{Error, Result};

pub struct NetServer {
    listener: TcpListener,
    secret: String,
}

/// Read request lines up to the terminating empty line. `None` if the peer
/// hung up first.
pub(crate) async fn read_message(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<String>> {
    let mut msg = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            return Ok(Some(msg));
        }
        msg.push_str(&line);
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::InvalidState(format!("tick worker failed: {e}"))
}

impl NetServer {
    pub async fn bind(addr: impl ToSocketAddrs, secret: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            secret: secret.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until one presents the secret.
    async fn accept_agent(&self) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            let (rd, wr) = stream.into_split();
            let mut reader = BufReader::new(rd);
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(_) if line.trim_end_matches(['\r', '\n']) == self.secret => {
                    info!("🤝 agent connected from {}", peer);
                    return Ok((reader, wr));
                }
                Ok(_) => warn!("⛔ {} sent a wrong secret, closing", peer),
                Err(e) => warn!("⛔ handshake with {} failed: {}", peer, e),
            }
        }
    }

    /// Run the whole session against one agent and hand the session back.
    pub async fn run<B: Broker + 'static>(&self, session: Session<B>) -> Result<Session<B>> {
        let (mut reader, mut writer) = self.accept_agent().await?;
        let mut session = session;

        loop {
            let (s, status) = tokio::task::spawn_blocking(move || {
                let status = session.advance();
                (session, status)
            })
            .await
            .map_err(join_error)?;
            session = s;

            match status {
                Ok(TickStatus::Continue) => {}
                Ok(TickStatus::SessionEnd) => {
                    writer.shutdown().await?;
                    info!("👋 session over, agent disconnected");
                    return Ok(session);
                }
                Err(Error::Replay(e)) => {
                    error!("tick {} skipped, replay failed: {}", session.tick(), e);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let state = session.build_msg_out()?;
            writer.write_all(state.as_bytes()).await?;
            writer.flush().await?;

            let Some(msg) = read_message(&mut reader).await? else {
                return Err(Error::Protocol(format!("agent hung up during tick {}", session.tick())));
            };

            let (s, summary) = tokio::task::spawn_blocking(move || {
                let summary = session.apply_msg_in(&msg);
                (session, summary)
            })
            .await
            .map_err(join_error)?;
            session = s;
            let summary = summary?;
            if summary.requests > 0 {
                info!(
                    "tick {}: {} request(s), {} executed, {} dropped, {} throttled{}",
                    session.tick(),
                    summary.requests,
                    summary.executed,
                    summary.dropped,
                    summary.throttled,
                    if summary.interrupted { ", interrupted" } else { "" }
                );
            }
        }
    }
}

//! Agent-side connection: receives state blocks, sends request lists.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::book::message::{BLOCK_CLOSE, BLOCK_OPEN};
use crate::book::{Catalog, Order, Request};
use crate::core::{Error, Result};

pub struct NetClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl NetClient {
    /// Connect and present the shared secret.
    pub async fn connect(addr: impl ToSocketAddrs, secret: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (rd, mut writer) = stream.into_split();
        writer.write_all(format!("{secret}\n").as_bytes()).await?;
        writer.flush().await?;
        Ok(Self {
            reader: BufReader::new(rd),
            writer,
        })
    }

    /// Next raw state block, or `None` once the server closed the session.
    pub async fn recv_block(&mut self) -> Result<Option<String>> {
        let mut block = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                if block.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol("connection closed inside a state block".into()));
            }
            let trimmed = line.trim();
            if block.is_empty() && trimmed != BLOCK_OPEN {
                return Err(Error::Protocol(format!("expected {BLOCK_OPEN:?}, got {trimmed:?}")));
            }
            block.push_str(&line);
            if trimmed == BLOCK_CLOSE {
                return Ok(Some(block));
            }
        }
    }

    /// Next state block parsed into a catalog mirror.
    pub async fn recv_state(&mut self) -> Result<Option<Catalog<Order>>> {
        match self.recv_block().await? {
            Some(block) => Ok(Some(Catalog::parse_state(&block)?)),
            None => Ok(None),
        }
    }

    /// Send this tick's requests (possibly none).
    pub async fn send_requests(&mut self, requests: &[Request]) -> Result<()> {
        let mut msg = String::new();
        for r in requests {
            msg.push_str(&r.to_string());
            msg.push('\n');
        }
        msg.push('\n');
        self.writer.write_all(msg.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

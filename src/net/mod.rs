//! Line-protocol transport between the engine and the decision agent.

pub mod client;
pub mod server;

pub use client::NetClient;
pub use server::NetServer;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{InstrumentKind, Ladder, OrderBook, ReqKind, Request};
    use crate::broker::replay::{Replay, format_depth_line};
    use crate::broker::{Session, SessionClock, Simulation};
    use crate::core::types::{BEST_ASK, BEST_BID, PriceQty};

    const OPEN: u32 = 9 * 3600;

    fn session() -> Session<Simulation> {
        let mut l = Ladder::default();
        l.0[BEST_ASK] = PriceQty::new(10_000, 50);
        l.0[BEST_BID] = PriceQty::new(9_990, 40);
        let quotes = format_depth_line(OPEN, "005930", 9_995, 100, &l);
        let trades = format!("{} 005930 9990 45\n", OPEN + 12);
        let mut book = OrderBook::new(1_000_000);
        book.add_instrument("005930", InstrumentKind::Equity, 0);
        let sim = Simulation::new(book, Replay::from_strings(&quotes, &trades), 20);
        let clock = SessionClock {
            open: OPEN,
            close: OPEN + 30,
            tick_secs: 10,
        };
        Session::new(sim, clock)
    }

    #[tokio::test]
    async fn test_handshake_and_tick_round_trip() {
        let server = NetServer::bind("127.0.0.1:0", "s3cret").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(async move { server.run(session()).await });

        // wrong secret: closed without a state block
        let mut intruder = NetClient::connect(addr, "guess").await.unwrap();
        assert!(intruder.recv_state().await.unwrap().is_none());

        let mut agent = NetClient::connect(addr, "s3cret").await.unwrap();
        let first = agent.recv_state().await.unwrap().unwrap();
        assert_eq!(first.tick(), 1);
        assert_eq!(first.instrument("005930").unwrap().ladder.best_bid().price, 9_990);
        agent
            .send_requests(&[Request::new(ReqKind::Buy, "005930", 9_990, 5)])
            .await
            .unwrap();

        let second = agent.recv_state().await.unwrap().unwrap();
        assert_eq!(second.tick(), 2);
        // 40 ahead, then 5 filled out of the 45 print
        assert_eq!(second.instrument("005930").unwrap().idle_holdings, 5);
        assert_eq!(second.stats().sum_buy, 49_950);
        agent.send_requests(&[]).await.unwrap();

        let mut ticks = 2;
        while let Some(_state) = agent.recv_state().await.unwrap() {
            agent.send_requests(&[]).await.unwrap();
            ticks += 1;
        }
        assert_eq!(ticks, 3);

        let session = handle.await.unwrap().unwrap();
        assert!(session.is_ended());
    }

    struct Unreadable;

    impl std::io::Read for Unreadable {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("device gone"))
        }
    }

    #[tokio::test]
    async fn test_replay_failure_keeps_serving_until_close() {
        let replay = Replay::from_readers(
            Box::new(std::io::BufReader::new(Unreadable)),
            Box::new(std::io::Cursor::new(Vec::new())),
        );
        let mut book = OrderBook::new(1_000_000);
        book.add_instrument("005930", InstrumentKind::Equity, 0);
        let clock = SessionClock {
            open: OPEN,
            close: OPEN + 30,
            tick_secs: 10,
        };
        let session = Session::new(Simulation::new(book, replay, 20), clock);

        let server = NetServer::bind("127.0.0.1:0", "s3cret").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(async move { server.run(session).await });

        // every tick is lost, so the agent only sees the close
        let mut agent = NetClient::connect(addr, "s3cret").await.unwrap();
        assert!(agent.recv_state().await.unwrap().is_none());

        let session = handle.await.unwrap().unwrap();
        assert!(session.is_ended());
        assert_eq!(session.tick(), 4);
    }
}

//! Book-keeping: instruments, cash, my orders, and the request pipeline that
//! mutates them.

pub mod catalog;
pub mod message;
pub mod orderbook;
pub mod request;
pub mod security;

pub use catalog::{Catalog, Evaluation, Stats, TickStat};
pub use orderbook::OrderBook;
pub use request::{Allotment, Op, ReqKind, Request, parse_message};
pub use security::{BookOrder, Detail, Instrument, InstrumentKind, Ladder, Order, WarrantDetail};

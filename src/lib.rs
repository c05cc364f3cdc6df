//! aleph-broker - Core Library
//! Tick-driven order-book accounting, queue-position simulation and the
//! agent gateway

// Public modules
pub mod book;
pub mod broker;
pub mod core;
pub mod net;

// Re-exports
pub use crate::book::{Catalog, OrderBook, Request};
pub use crate::broker::{Broker, Session, SessionClock, TickStatus};
pub use crate::core::{Config, Error, Result};

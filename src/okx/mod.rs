pub mod client;
pub mod models;

pub use client::{ExchangeApi, OkxClient, RetryPolicy, DEFAULT_BASE_URL};
pub use models::{Instrument, OrderBook, TickerSnapshot};

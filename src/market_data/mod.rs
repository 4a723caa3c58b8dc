pub mod candle;
pub mod candle_cache;
pub mod store;

pub use candle::{Candle, CandleKey, CandleSeries, Coverage};
pub use candle_cache::{CandleCache, Source, TtlTable};
pub use store::{CandleStore, FileCandleStore, InMemoryCandleStore};

pub mod candle;
pub mod global;
pub mod overlay;
pub mod price_table;
pub mod series_cache;
pub mod tickers;
pub mod trade_stream;

// Re-exports for convenient access (e.g. `use crate::market_data::LatestPriceTable`).
pub use price_table::LatestPriceTable;
pub use trade_stream::{IngesterSettings, StreamIngester};

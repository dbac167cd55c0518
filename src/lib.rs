//! NexusFeed backend library.
//!
//! Multi-exchange market-data aggregation: venue pollers feed a normalizer,
//! the normalized stream fans out to SQLite persistence, a Redis hot cache
//! and WebSocket subscribers, and a replay engine serves time-scaled
//! historical streams back out of storage.

pub mod api;
pub mod books;
pub mod errors;
pub mod feed;
pub mod metrics;
pub mod models;
pub mod normalizer;
pub mod publisher;
pub mod recorder;
pub mod replay;
pub mod storage;
pub mod venues;

pub use feed::{FeedConfig, FeedManager};
pub use models::{BookSnapshot, Config, Trade};
pub use publisher::Publisher;
pub use storage::{BookCache, Repo};

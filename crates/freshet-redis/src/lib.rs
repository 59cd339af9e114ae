//! # freshet-redis
//!
//! Redis Streams reader for the Freshet consumption loop.
//!
//! This crate implements freshet-core's `StreamReader` contract on top of the
//! `redis` crate: one `read` call maps to a single
//! `XREAD BLOCK <ms> [COUNT <n>] STREAMS key... id...` round-trip.
//!
//! ```rust,ignore
//! use freshet_core::StreamManager;
//! use freshet_redis::RedisStreamReader;
//!
//! let reader = RedisStreamReader::connect("redis://127.0.0.1:6379").await?;
//! let manager = StreamManager::new(reader);
//! manager.on("orders", std::sync::Arc::new(|data, id, stream| {
//!     println!("{stream} {id}: {data:?}");
//! }));
//! ```

pub mod reader;

pub use reader::RedisStreamReader;

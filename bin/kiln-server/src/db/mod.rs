//! Durable storage.
//!
//! The conversion cache talks to its backing store through
//! [`kiln_core::cache::CacheStore`]. The default implementation is
//! [`sqlite::SqliteCacheStore`]; to swap databases, implement the trait for a
//! new type and hand it to [`kiln_core::ConversionCache::with_durable`].

pub mod sqlite;

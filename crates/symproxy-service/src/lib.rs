//! A pull-through cache for debug symbol files.
//!
//! Symbols are requested by a three-part key. Cached files are served from the local store,
//! missing ones are downloaded from upstream symbol servers in the background.

#[macro_use]
pub mod metrics;

pub mod compression;
pub mod config;
pub mod download;
pub mod key;
pub mod service;
pub mod store;
pub mod tracking;

//! Gator - A command line RSS feed aggregator
//!
//! Users register, add and follow feeds, and the aggregator periodically
//! fetches the least recently fetched feed and stores its items as posts.

pub mod aggregator;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;

pub use error::{Error, FetchError, Result};

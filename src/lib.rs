//! treefetch library
//!
//! Filtered file retrieval over TCP: a daemon that archives matching files
//! from its home tree, and a client that requests, receives and unpacks them.

pub mod archive;
pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod logger;
pub mod matcher;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod transfer;

pub use error::{Error, Result};

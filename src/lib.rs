//! Library crate for lan-ipam-rs: subnet address management with continuous
//! liveness monitoring.
pub mod address_space;
pub mod aggregate;
pub mod arp;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod netdetect;
pub mod scanner;
pub mod scheduler;
pub mod server;
pub mod types;

pub use error::{Error, Result};

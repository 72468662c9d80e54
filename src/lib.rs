//! Metashop: product identification by binary-descriptor image matching,
//! served over a length-prefixed JSON protocol.

pub mod catalog;
pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod features;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod types;

//! # Echotrap Core
//!
//! Shared foundation for the capture plane: the configuration loaded at
//! startup, the error taxonomy every subsystem maps onto, the capture and
//! response-tree data model, the subdomain grammar, and the IP-to-country
//! table.
//!
//! Nothing here performs I/O besides configuration and geo-table loading;
//! the store, resolver and HTTP engine build on these types.

mod config;
mod error;
pub mod geo;
pub mod subdomain;
mod types;

pub use config::EchotrapConfig;
pub use error::{Error, Result};
pub use types::{
    BasicCapture, Capture, DnsCapture, DnsRecord, DnsRecordInput, HttpCapture, ResponseFile,
    ResponseHeader, ResponseNode, ResponseTree, DNS_RECORD_TYPES, INDEX_FILE,
};

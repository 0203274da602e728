//! Environment-driven configuration for the capture service.
//!
//! A single `EchotrapConfig` is loaded at startup and immutable afterwards.
//! Every option has a default suitable for local development; deployments
//! override via environment variables (`SERVER_DOMAIN`, `JWT_SECRET`, ...)
//! using the same names as the struct fields, uppercased.

use anyhow::Result;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the capture service.
///
/// Shared read-only across every subsystem: the DNS authority, the HTTP
/// engine, the store facade and the token authority all hold an `Arc` of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchotrapConfig {
    /// Root domain this service is authoritative for (`*.server_domain`).
    pub server_domain: String,

    /// Public IP answered for A (and, if it parses as v6, AAAA) queries
    /// with no configured record.
    pub server_ip: String,

    /// Length of minted subdomains.
    pub subdomain_length: usize,

    /// Alphabet minted subdomains are drawn from.
    pub subdomain_alphabet: String,

    /// HMAC secret for session tokens.
    pub jwt_secret: String,

    /// Cap on a single response leaf's `raw` payload, in bytes.
    pub max_file_size: usize,

    /// Cap on captured request bodies, in bytes. Excess is dropped silently.
    pub max_request_size: usize,

    /// Retention for all per-subdomain keys, in days.
    pub ttl_days: u64,

    /// When set, the seeded response tree carries a `Server:` header.
    pub include_server_domain: bool,

    /// Public port for the HTTP engine.
    pub http_port: u16,

    /// Port for the authoritative resolver (UDP and TCP).
    pub dns_port: u16,

    /// TXT answer for names with no configured record.
    pub dns_txt_default: String,

    /// Directory for the embedded store.
    pub data_dir: PathBuf,

    /// Static dashboard asset tree served on the root host.
    pub public_dir: PathBuf,

    /// Optional dbip-country-lite CSV (gzip) for capture country tagging.
    #[serde(default)]
    pub geoip_path: Option<PathBuf>,
}

impl EchotrapConfig {
    /// Load configuration from the environment over built-in defaults.
    pub fn load() -> Result<Self> {
        let cfg = Config::builder()
            .set_default("server_domain", "localhost")?
            .set_default("server_ip", "127.0.0.1")?
            .set_default("subdomain_length", 8i64)?
            .set_default("subdomain_alphabet", "0123456789abcdefghijklmnopqrstuvwxyz")?
            .set_default("jwt_secret", "secret")?
            .set_default("max_file_size", (2 * 1024 * 1024) as i64)?
            .set_default("max_request_size", (10 * 1024 * 1024) as i64)?
            .set_default("ttl_days", 7i64)?
            .set_default("include_server_domain", false)?
            .set_default("http_port", 80i64)?
            .set_default("dns_port", 53i64)?
            .set_default("dns_txt_default", "Hello!")?
            .set_default("data_dir", "./data")?
            .set_default("public_dir", "./public")?
            .add_source(Environment::default())
            .build()?;

        let mut config: EchotrapConfig = cfg.try_deserialize()?;
        // Hostname comparisons assume a lowercase root.
        config.server_domain = config.server_domain.to_lowercase();
        Ok(config)
    }

    /// Retention for per-subdomain keys.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days * 24 * 60 * 60)
    }
}

impl Default for EchotrapConfig {
    fn default() -> Self {
        Self {
            server_domain: "localhost".to_string(),
            server_ip: "127.0.0.1".to_string(),
            subdomain_length: 8,
            subdomain_alphabet: "0123456789abcdefghijklmnopqrstuvwxyz".to_string(),
            jwt_secret: "secret".to_string(),
            max_file_size: 2 * 1024 * 1024,
            max_request_size: 10 * 1024 * 1024,
            ttl_days: 7,
            include_server_domain: false,
            http_port: 80,
            dns_port: 53,
            dns_txt_default: "Hello!".to_string(),
            data_dir: PathBuf::from("./data"),
            public_dir: PathBuf::from("./public"),
            geoip_path: None,
        }
    }
}

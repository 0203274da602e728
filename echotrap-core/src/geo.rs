//! IP-to-country lookup over the dbip-country-lite CSV.
//!
//! The table is parsed once at startup and immutable afterwards, so it is
//! shared freely across tasks. Lookup is a pure function from dotted-quad to
//! ISO-3166 alpha-2 code; with no table loaded every lookup returns `None`
//! and captures simply carry no country.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::info;

/// Sorted `(range_start, country)` pairs over the IPv4 space.
#[derive(Debug, Default)]
pub struct GeoTable {
    entries: Vec<(u32, String)>,
}

impl GeoTable {
    /// A table that never resolves. Used when no database file is configured.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a gzip'd `ip_from,ip_to,country` CSV. IPv6 rows are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening geoip database {}", path.display()))?;
        let reader = BufReader::new(GzDecoder::new(file));

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.context("reading geoip database")?;
            let mut fields = line.split(',');
            let (Some(from), Some(_to), Some(country)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(addr) = from.parse::<Ipv4Addr>() else {
                continue;
            };
            entries.push((u32::from(addr), country.trim().to_string()));
        }
        entries.sort_by_key(|(start, _)| *start);

        info!(ranges = entries.len(), "loaded ip2country table");
        Ok(Self { entries })
    }

    /// Country code for a dotted-quad address, if the table covers it.
    pub fn lookup(&self, ip: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let addr: Ipv4Addr = ip.parse().ok()?;
        let needle = u32::from(addr);
        let idx = self.entries.partition_point(|(start, _)| *start <= needle);
        if idx == 0 {
            return None;
        }
        Some(self.entries[idx - 1].1.as_str())
    }
}

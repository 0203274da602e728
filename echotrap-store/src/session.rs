//! Per-subdomain keyspace operations: minting, the response tree, DNS
//! records and the capture log.
//!
//! Keyspace (all string values):
//! - `subdomain:<sub>` uniqueness marker
//! - `files:<sub>` whole response tree, one JSON blob
//! - `dns:<sub>` aggregate record list
//! - `dns:<TYPE>:<fqdn>` resolver buckets, JSON list of values
//! - `requests:<sub>` append-only capture list
//! - `request:<sub>:<id>` list index of one capture
//! - `pubsub:<sub>` fan-out channel
//!
//! Multi-key updates are writer-ordered but not transactional; readers treat
//! dangling buckets or indexes as absent data.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use echotrap_core::{
    subdomain, Capture, DnsRecord, DnsRecordInput, EchotrapConfig, ResponseTree, Result,
    DNS_RECORD_TYPES,
};

use crate::kv::Store;

/// Literal written over a deleted capture's list slot.
pub const TOMBSTONE: &str = "{}";

/// Facade over [`Store`] owning the per-subdomain keyspace.
#[derive(Clone)]
pub struct SessionStore {
    store: Store,
    config: Arc<EchotrapConfig>,
}

impl SessionStore {
    pub fn new(store: Store, config: Arc<EchotrapConfig>) -> Self {
        Self { store, config }
    }

    /// The underlying store handle (renewer job, tests).
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EchotrapConfig {
        &self.config
    }

    fn ttl(&self) -> Duration {
        self.config.ttl()
    }

    fn marker_key(sub: &str) -> String {
        format!("subdomain:{}", sub)
    }

    fn files_key(sub: &str) -> String {
        format!("files:{}", sub)
    }

    fn dns_key(sub: &str) -> String {
        format!("dns:{}", sub)
    }

    fn bucket_key(record_type: &str, fqdn: &str) -> String {
        format!("dns:{}:{}", record_type, fqdn)
    }

    fn requests_key(sub: &str) -> String {
        format!("requests:{}", sub)
    }

    fn index_key(sub: &str, id: &str) -> String {
        format!("request:{}:{}", sub, id)
    }

    fn channel(sub: &str) -> String {
        format!("pubsub:{}", sub)
    }

    /// Whether a subdomain is currently live.
    pub async fn subdomain_exists(&self, sub: &str) -> Result<bool> {
        Ok(self.store.get(&Self::marker_key(sub)).await?.is_some())
    }

    /// Mint a fresh subdomain: loop until the uniqueness marker is absent,
    /// claim it with the configured TTL and seed the default response tree.
    pub async fn mint_subdomain(&self) -> Result<String> {
        loop {
            let sub = subdomain::random(
                &self.config.subdomain_alphabet,
                self.config.subdomain_length,
            );
            if self.subdomain_exists(&sub).await? {
                continue;
            }
            self.store
                .set(&Self::marker_key(&sub), "1", Some(self.ttl()))
                .await?;
            self.seed_tree(&sub).await?;
            debug!(subdomain = %sub, "minted session");
            return Ok(sub);
        }
    }

    /// Write the default response tree for a subdomain.
    pub async fn seed_tree(&self, sub: &str) -> Result<ResponseTree> {
        let tree = ResponseTree::default_tree(
            self.config.include_server_domain,
            &self.config.server_domain,
        );
        self.put_tree(sub, &tree).await?;
        Ok(tree)
    }

    /// The subdomain's response tree, seeding the default when missing.
    /// A corrupt stored blob reads as the default tree without rewriting it.
    pub async fn tree(&self, sub: &str) -> Result<ResponseTree> {
        match self.store.get(&Self::files_key(sub)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_else(|_| {
                ResponseTree::default_tree(
                    self.config.include_server_domain,
                    &self.config.server_domain,
                )
            })),
            None => self.seed_tree(sub).await,
        }
    }

    /// Replace the whole response tree atomically (single value write).
    pub async fn put_tree(&self, sub: &str, tree: &ResponseTree) -> Result<()> {
        let raw = serde_json::to_string(tree)
            .map_err(|e| echotrap_core::Error::Validation(e.to_string()))?;
        self.store
            .set(&Self::files_key(sub), &raw, Some(self.ttl()))
            .await
    }

    /// The aggregate DNS record list, empty when unset or unreadable.
    pub async fn dns_records(&self, sub: &str) -> Result<Vec<DnsRecord>> {
        match self.store.get(&Self::dns_key(sub)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the subdomain's DNS records: delete the old per-key buckets,
    /// then write the new buckets and the aggregate. Grammar validation is
    /// the caller's job; this is the mechanical, I4-ordered write.
    pub async fn replace_dns_records(
        &self,
        sub: &str,
        records: &[DnsRecordInput],
    ) -> Result<Vec<DnsRecord>> {
        for old in self.dns_records(sub).await? {
            self.store
                .delete(&Self::bucket_key(&old.record_type, &old.domain))
                .await?;
        }

        let mut aggregate = Vec::with_capacity(records.len());
        let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in records {
            let record_type = DNS_RECORD_TYPES
                .get(record.record_type as usize)
                .copied()
                .unwrap_or("A");
            let fqdn = format!(
                "{}.{}.{}.",
                record.domain.to_lowercase(),
                sub,
                self.config.server_domain
            );
            buckets
                .entry(Self::bucket_key(record_type, &fqdn))
                .or_default()
                .push(record.value.clone());
            aggregate.push(DnsRecord {
                domain: fqdn,
                record_type: record_type.to_string(),
                value: record.value.clone(),
            });
        }

        for (key, values) in &buckets {
            let raw = serde_json::to_string(values)
                .map_err(|e| echotrap_core::Error::Validation(e.to_string()))?;
            self.store.set(key, &raw, Some(self.ttl())).await?;
        }
        let raw = serde_json::to_string(&aggregate)
            .map_err(|e| echotrap_core::Error::Validation(e.to_string()))?;
        self.store
            .set(&Self::dns_key(sub), &raw, Some(self.ttl()))
            .await?;
        Ok(aggregate)
    }

    /// Resolver-side bucket lookup: the value list for `(type, fqdn)`.
    /// An unreadable bucket reads as no record.
    pub async fn resolver_values(
        &self,
        record_type: &str,
        fqdn: &str,
    ) -> Result<Option<Vec<String>>> {
        match self.store.get(&Self::bucket_key(record_type, fqdn)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Append a capture and publish it to live sessions.
    ///
    /// Contract order for a fixed subdomain: publish, then append, then
    /// write the secondary index. Returns the capture's list index.
    pub async fn log_capture(&self, capture: &Capture) -> Result<u64> {
        let sub = capture.subdomain().to_string();
        let data = serde_json::to_string(capture)
            .map_err(|e| echotrap_core::Error::StoreWrite(e.to_string()))?;

        self.store.publish(&Self::channel(&sub), &data).await;
        let new_len = self.store.append(&Self::requests_key(&sub), &data).await?;
        self.store
            .expire(&Self::requests_key(&sub), self.ttl())
            .await?;
        let index = new_len - 1;
        self.store
            .set(
                &Self::index_key(&sub, capture.id()),
                &index.to_string(),
                Some(self.ttl()),
            )
            .await?;
        Ok(index)
    }

    /// Captures in append order, tombstones skipped, then `(offset, limit)`
    /// windowed. `limit` 0 means no bound.
    pub async fn list_captures(
        &self,
        sub: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let entries = self.store.range(&Self::requests_key(sub)).await?;
        let live = entries
            .iter()
            .filter(|raw| raw.as_str() != TOMBSTONE)
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .skip(offset);
        Ok(if limit == 0 {
            live.collect()
        } else {
            live.take(limit).collect()
        })
    }

    /// One capture by id via the secondary index. A missing index entry or a
    /// tombstoned slot both read as absent.
    pub async fn capture_by_id(&self, sub: &str, id: &str) -> Result<Option<serde_json::Value>> {
        let Some(index) = self.store.get(&Self::index_key(sub, id)).await? else {
            return Ok(None);
        };
        let Ok(index) = index.parse::<u64>() else {
            return Ok(None);
        };
        let Some(raw) = self.store.index_at(&Self::requests_key(sub), index).await? else {
            return Ok(None);
        };
        if raw == TOMBSTONE {
            return Ok(None);
        }
        Ok(serde_json::from_str(&raw).ok())
    }

    /// Tombstone one capture: overwrite its slot with `{}` and drop the
    /// secondary index. The list is never compacted.
    pub async fn tombstone(&self, sub: &str, id: &str) -> Result<()> {
        if let Some(index) = self.store.get(&Self::index_key(sub, id)).await? {
            if let Ok(index) = index.parse::<u64>() {
                self.store
                    .set_at(&Self::requests_key(sub), index, TOMBSTONE)
                    .await?;
            }
            self.store.delete(&Self::index_key(sub, id)).await?;
        }
        Ok(())
    }

    /// Purge the capture list and every secondary index for a subdomain.
    pub async fn purge_captures(&self, sub: &str) -> Result<()> {
        let entries = self.store.range(&Self::requests_key(sub)).await?;
        let ids: Vec<String> = entries
            .iter()
            .filter(|raw| raw.as_str() != TOMBSTONE)
            .filter_map(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .filter_map(|v| v.get("id").and_then(|id| id.as_str()).map(String::from))
            .collect();

        self.store.delete_list(&Self::requests_key(sub)).await?;
        for id in ids {
            self.store.delete(&Self::index_key(sub, &id)).await?;
        }
        Ok(())
    }

    /// Subscribe to a subdomain's live capture channel.
    pub fn subscribe(&self, sub: &str) -> broadcast::Receiver<String> {
        self.store.subscribe(&Self::channel(sub))
    }

    /// ACME challenge write path: replace the TXT resolver bucket for a
    /// fully qualified name directly. Used by the certificate-renewal job,
    /// which owns no subdomain.
    pub async fn publish_txt_challenge(&self, domain: &str, tokens: &[String]) -> Result<()> {
        let fqdn = if domain.ends_with('.') {
            domain.to_string()
        } else {
            format!("{}.", domain)
        };
        let raw = serde_json::to_string(tokens)
            .map_err(|e| echotrap_core::Error::StoreWrite(e.to_string()))?;
        self.store
            .set(&Self::bucket_key("TXT", &fqdn), &raw, Some(self.ttl()))
            .await
    }
}

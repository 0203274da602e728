//! Shared data model: capture records, the per-subdomain response tree and
//! DNS record shapes.
//!
//! Everything here is a wire or stored shape; field names are load-bearing
//! for the dashboard and the stored keyspace.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// One logged external interaction, tagged by transport.
///
/// Stored JSON-encoded in the `requests:<sub>` list and published verbatim
/// on the subdomain's fan-out channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Capture {
    Http(HttpCapture),
    Dns(DnsCapture),
    Smtp(BasicCapture),
    Tcp(BasicCapture),
}

impl Capture {
    pub fn id(&self) -> &str {
        match self {
            Capture::Http(c) => &c.id,
            Capture::Dns(c) => &c.id,
            Capture::Smtp(c) | Capture::Tcp(c) => &c.id,
        }
    }

    pub fn subdomain(&self) -> &str {
        match self {
            Capture::Http(c) => &c.subdomain,
            Capture::Dns(c) => &c.subdomain,
            Capture::Smtp(c) | Capture::Tcp(c) => &c.subdomain,
        }
    }
}

/// HTTP capture: the full request addressed at a subdomain host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCapture {
    pub id: String,
    pub subdomain: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub port: u16,
    /// Unix seconds.
    pub date: i64,
    /// Base64 of the request body, bounded by `max_request_size`.
    pub raw: String,
    pub method: String,
    pub protocol: String,
    /// Header names exactly as received, in arrival order, last value wins.
    pub headers: serde_json::Map<String, serde_json::Value>,
    pub path: String,
    /// `?`-prefixed query string, or empty.
    pub query: String,
    /// `#`-prefixed fragment, or empty. Servers never see fragments, so this
    /// is empty in practice; the field is kept for the dashboard shape.
    pub fragment: String,
    pub url: String,
}

/// DNS capture: one resolver question attributed to a subdomain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsCapture {
    pub id: String,
    pub subdomain: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub port: u16,
    pub date: i64,
    /// Base64 of the raw query packet.
    pub raw: String,
    pub query_type: String,
    pub name: String,
    pub reply_text: String,
}

/// Capture with common fields only (SMTP and raw-TCP listeners reuse the
/// same pipeline and need nothing transport-specific here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicCapture {
    pub id: String,
    pub subdomain: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub port: u16,
    pub date: i64,
    pub raw: String,
}

/// One response header as the dashboard edits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub header: String,
    pub value: String,
}

/// A leaf of the response tree: the custom reply served for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFile {
    /// Base64 of the response body.
    pub raw: String,
    pub headers: Vec<ResponseHeader>,
    pub status_code: u16,
}

/// A node of the response tree. Interior keys end in `/`, leaf keys are bare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseNode {
    File(ResponseFile),
    Dir(ResponseTree),
}

/// The per-subdomain response tree, stored whole under `files:<sub>` so every
/// edit is a single atomic value write. The root always holds `index.html`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseTree(pub BTreeMap<String, ResponseNode>);

pub const INDEX_FILE: &str = "index.html";

impl ResponseTree {
    /// The tree seeded for a fresh subdomain: an empty `index.html` with
    /// permissive CORS, plus a `Server:` header when configured.
    pub fn default_tree(include_server_domain: bool, server_domain: &str) -> Self {
        let mut headers = vec![
            ResponseHeader {
                header: "Access-Control-Allow-Origin".to_string(),
                value: "*".to_string(),
            },
            ResponseHeader {
                header: "Content-Type".to_string(),
                value: "text/html; charset=utf-8".to_string(),
            },
        ];
        if include_server_domain {
            headers.push(ResponseHeader {
                header: "Server".to_string(),
                value: server_domain.to_string(),
            });
        }

        let index = ResponseFile {
            raw: String::new(),
            headers,
            status_code: 200,
        };
        let mut root = BTreeMap::new();
        root.insert(INDEX_FILE.to_string(), ResponseNode::File(index));
        ResponseTree(root)
    }

    /// Validate tree shape: key suffixes agree with node kinds, every leaf
    /// has a plausible status code and a bounded body, and the root keeps
    /// its `index.html` leaf.
    pub fn validate(&self, max_file_size: usize) -> Result<()> {
        if !matches!(self.0.get(INDEX_FILE), Some(ResponseNode::File(_))) {
            return Err(Error::Validation(
                "index.html cannot be deleted".to_string(),
            ));
        }
        self.validate_level("")
            .and_then(|_| self.validate_sizes("", max_file_size))
    }

    fn validate_level(&self, prefix: &str) -> Result<()> {
        for (key, node) in &self.0 {
            let path = format!("{}{}", prefix, key);
            match node {
                ResponseNode::Dir(dir) => {
                    if !key.ends_with('/') {
                        return Err(Error::Validation(format!(
                            "Invalid file structure for {}",
                            path
                        )));
                    }
                    dir.validate_level(&path)?;
                }
                ResponseNode::File(_) => {
                    if key.ends_with('/') {
                        return Err(Error::Validation(format!(
                            "Invalid file structure for {}",
                            path
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_sizes(&self, prefix: &str, max_file_size: usize) -> Result<()> {
        for (key, node) in &self.0 {
            let path = format!("{}{}", prefix, key);
            match node {
                ResponseNode::Dir(dir) => dir.validate_sizes(&path, max_file_size)?,
                ResponseNode::File(file) => {
                    if file.raw.len() > max_file_size {
                        return Err(Error::Validation(format!("File too large: {}", path)));
                    }
                    if !(100..=599).contains(&file.status_code) {
                        return Err(Error::Validation(format!(
                            "Invalid status_code file structure for {}",
                            path
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk `path` through the tree and pick the response to serve.
    ///
    /// At each level the full remaining path is tried first, so flat leaf
    /// keys like `api/v1` match exactly. Otherwise, per segment: a leaf key
    /// match wins and stops the walk; an interior `<seg>/` match descends
    /// (remembering that directory's `index.html` if present); anything else
    /// ends the walk. With no match the root `index.html` is served.
    pub fn resolve(&self, path: &str) -> Option<&ResponseFile> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut current = self;
        let mut best: Option<&ResponseFile> = None;
        let mut remaining = segments.as_slice();

        while let Some((segment, rest)) = remaining.split_first() {
            if let Some(ResponseNode::File(file)) = current.0.get(&remaining.join("/")) {
                best = Some(file);
                break;
            }
            if let Some(ResponseNode::File(file)) = current.0.get(*segment) {
                best = Some(file);
                break;
            }
            let dir_key = format!("{}/", segment);
            match current.0.get(&dir_key) {
                Some(ResponseNode::Dir(dir)) => {
                    current = dir;
                    if let Some(ResponseNode::File(index)) = current.0.get(INDEX_FILE) {
                        best = Some(index);
                    }
                    remaining = rest;
                }
                _ => break,
            }
        }

        best.or_else(|| match self.0.get(INDEX_FILE) {
            Some(ResponseNode::File(index)) => Some(index),
            _ => None,
        })
    }
}

/// DNS record types a subdomain may configure, in dashboard type-code order.
pub const DNS_RECORD_TYPES: [&str; 4] = ["A", "AAAA", "CNAME", "TXT"];

/// One record as submitted by the dashboard (`type` is an index into
/// [`DNS_RECORD_TYPES`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecordInput {
    pub domain: String,
    #[serde(rename = "type")]
    pub record_type: i64,
    pub value: String,
}

/// One record as stored in the per-subdomain aggregate: fully qualified,
/// trailing dot, type as its string name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub domain: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
}

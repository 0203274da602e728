//! Authoritative resolver for the root domain's wildcard.
//!
//! Answers A/AAAA/CNAME/TXT from the store's resolver buckets and falls back
//! to the configured server identity when nothing is set. Every record
//! carries TTL 1 so users can iterate without fighting caches. Replies are
//! sent before the capture write; the log path never blocks or fails a
//! response.

use rand::seq::SliceRandom;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata;
use hickory_proto::rr::{Name, RData, Record, RecordType};

use echotrap_core::geo::GeoTable;
use echotrap_core::{subdomain, Capture, DnsCapture, EchotrapConfig};
use echotrap_store::SessionStore;

/// TTL for every authoritative answer.
const ANSWER_TTL: u32 = 1;

/// The DNS authority component. Binds UDP and TCP concurrently.
pub struct DnsAuthority {
    config: Arc<EchotrapConfig>,
    sessions: SessionStore,
    geo: Arc<GeoTable>,
}

/// A synthesized reply plus the capture attributed to it, if the query name
/// belongs to a live-format subdomain.
struct Outcome {
    wire: Vec<u8>,
    capture: Option<Capture>,
}

impl DnsAuthority {
    pub fn new(config: Arc<EchotrapConfig>, sessions: SessionStore, geo: Arc<GeoTable>) -> Self {
        Self {
            config,
            sessions,
            geo,
        }
    }

    /// Bind both sockets and serve until shutdown.
    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let bind = ("0.0.0.0", self.config.dns_port);
        let udp = Arc::new(UdpSocket::bind(bind).await?);
        let tcp = TcpListener::bind(bind).await?;
        info!(port = self.config.dns_port, "dns authority listening (udp+tcp)");

        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = udp.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            let authority = self.clone();
                            let socket = udp.clone();
                            let query = buf[..len].to_vec();
                            tokio::spawn(async move {
                                authority.handle_udp(socket, query, peer).await;
                            });
                        }
                        Err(err) => warn!(%err, "udp receive failed"),
                    }
                }
                accepted = tcp.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let authority = self.clone();
                            tokio::spawn(async move {
                                authority.handle_tcp(stream, peer).await;
                            });
                        }
                        Err(err) => warn!(%err, "tcp accept failed"),
                    }
                }
            }
        }

        info!("dns authority stopped");
        Ok(())
    }

    async fn handle_udp(&self, socket: Arc<UdpSocket>, query: Vec<u8>, peer: SocketAddr) {
        let Some(outcome) = self.answer(&query, peer).await else {
            return;
        };
        // Reply first; logging must never delay the answer.
        if let Err(err) = socket.send_to(&outcome.wire, peer).await {
            warn!(%err, %peer, "udp reply failed");
        }
        self.log_outcome(outcome.capture).await;
    }

    async fn handle_tcp(&self, mut stream: TcpStream, peer: SocketAddr) {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        if stream.read_exact(&mut query).await.is_err() {
            return;
        }

        let Some(outcome) = self.answer(&query, peer).await else {
            return;
        };
        let reply_len = (outcome.wire.len() as u16).to_be_bytes();
        if stream.write_all(&reply_len).await.is_err()
            || stream.write_all(&outcome.wire).await.is_err()
        {
            return;
        }
        self.log_outcome(outcome.capture).await;
    }

    /// Best-effort capture write. Queries keep answering when the store is
    /// down, so failures are only logged.
    async fn log_outcome(&self, capture: Option<Capture>) {
        let Some(capture) = capture else { return };
        if let Err(err) = self.sessions.log_capture(&capture).await {
            warn!(%err, "dns capture write failed");
        }
    }

    /// Parse a raw query and synthesize the authoritative reply. Malformed
    /// input elicits no reply at all.
    async fn answer(&self, raw: &[u8], peer: SocketAddr) -> Option<Outcome> {
        let request = Message::from_vec(raw).ok()?;
        let query = request.queries().first()?.clone();

        let qname = normalize_qname(&query.name().to_lowercase().to_string());
        let qtype = query.query_type();
        let name = query.name().to_lowercase();

        let (answers, texts) = self.answers_for(qtype, &qname, name).await;

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_authoritative(true)
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(false)
            .set_response_code(ResponseCode::NoError)
            .add_query(query);
        for answer in answers {
            response.add_answer(answer);
        }

        let wire = response.to_vec().ok()?;
        let capture = self.attribute(&qname, qtype, &texts, raw, peer);
        debug!(%qname, ?qtype, answers = texts.len(), "answered query");
        Some(Outcome { wire, capture })
    }

    /// Record set for one question, plus a plain-text rendering for the
    /// capture log.
    async fn answers_for(
        &self,
        qtype: RecordType,
        qname: &str,
        name: Name,
    ) -> (Vec<Record>, Vec<String>) {
        let mut answers = Vec::new();
        let mut texts = Vec::new();
        let mut push = |name: &Name, rdata: RData, text: String| {
            answers.push(Record::from_rdata(name.clone(), ANSWER_TTL, rdata));
            texts.push(text);
        };

        match qtype {
            RecordType::A => match self.lookup("A", qname).await {
                Some(values) => {
                    for value in values {
                        let Some(picked) = pick_value(&value) else {
                            continue;
                        };
                        if let Ok(ip) = picked.parse::<Ipv4Addr>() {
                            push(&name, RData::A(rdata::A(ip)), format!("A {}", ip));
                        }
                    }
                }
                None => {
                    if let Ok(ip) = self.config.server_ip.parse::<Ipv4Addr>() {
                        push(&name, RData::A(rdata::A(ip)), format!("A {}", ip));
                    }
                }
            },
            RecordType::AAAA => match self.lookup("AAAA", qname).await {
                Some(values) => {
                    for value in values {
                        let Some(picked) = pick_value(&value) else {
                            continue;
                        };
                        if let Ok(ip) = picked.parse::<Ipv6Addr>() {
                            push(&name, RData::AAAA(rdata::AAAA(ip)), format!("AAAA {}", ip));
                        }
                    }
                }
                None => {
                    // The configured address is usually v4; the fallback is
                    // an empty answer in that case.
                    if let Ok(ip) = self.config.server_ip.parse::<Ipv6Addr>() {
                        push(&name, RData::AAAA(rdata::AAAA(ip)), format!("AAAA {}", ip));
                    }
                }
            },
            RecordType::CNAME => match self.lookup("CNAME", qname).await {
                Some(values) => {
                    for value in values {
                        if let Ok(target) = Name::from_ascii(&value) {
                            push(
                                &name,
                                RData::CNAME(rdata::CNAME(target)),
                                format!("CNAME {}", value),
                            );
                        }
                    }
                }
                None => {
                    let root = format!("{}.", self.config.server_domain);
                    if let Ok(target) = Name::from_ascii(&root) {
                        push(
                            &name,
                            RData::CNAME(rdata::CNAME(target)),
                            format!("CNAME {}", root),
                        );
                    }
                }
            },
            RecordType::TXT => match self.lookup("TXT", qname).await {
                Some(values) => {
                    for value in values {
                        push(
                            &name,
                            RData::TXT(rdata::TXT::new(vec![value.clone()])),
                            format!("TXT {}", value),
                        );
                    }
                }
                None => {
                    let text = self.config.dns_txt_default.clone();
                    push(
                        &name,
                        RData::TXT(rdata::TXT::new(vec![text.clone()])),
                        format!("TXT {}", text),
                    );
                }
            },
            // Everything else gets an empty authoritative answer.
            _ => {}
        }

        (answers, texts)
    }

    /// Bucket lookup; a store failure reads as no record so the fallback
    /// answer still flows.
    async fn lookup(&self, record_type: &str, qname: &str) -> Option<Vec<String>> {
        match self.sessions.resolver_values(record_type, qname).await {
            Ok(values) => values,
            Err(err) => {
                warn!(%err, record_type, qname, "resolver bucket read failed");
                None
            }
        }
    }

    /// Attribute a query to its owning subdomain, if any, and build the
    /// capture record.
    fn attribute(
        &self,
        qname: &str,
        qtype: RecordType,
        texts: &[String],
        raw: &[u8],
        peer: SocketAddr,
    ) -> Option<Capture> {
        let sub = subdomain::from_qname(
            qname,
            &self.config.server_domain,
            &self.config.subdomain_alphabet,
            self.config.subdomain_length,
        )?;

        let ip = peer.ip().to_string();
        Some(Capture::Dns(DnsCapture {
            id: Uuid::new_v4().to_string(),
            subdomain: sub,
            country: self.geo.lookup(&ip).map(String::from),
            ip,
            port: peer.port(),
            date: chrono::Utc::now().timestamp(),
            raw: BASE64.encode(raw),
            query_type: qtype.to_string(),
            name: qname.to_string(),
            reply_text: texts.join("; "),
        }))
    }
}

/// Lowercased query name with the trailing dot the keyspace expects.
fn normalize_qname(qname: &str) -> String {
    if qname.ends_with('.') {
        qname.to_string()
    } else {
        format!("{}.", qname)
    }
}

/// Resolve the `a%b%c` multi-value form: one component, uniformly at random.
fn pick_value(value: &str) -> Option<String> {
    if value.contains('%') {
        let parts: Vec<&str> = value.split('%').collect();
        parts
            .choose(&mut rand::thread_rng())
            .map(|s| s.to_string())
    } else {
        Some(value.to_string())
    }
}

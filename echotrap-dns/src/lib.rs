//! # Echotrap DNS
//!
//! The authoritative resolver for `*.<root-domain>`: answers from the
//! store's per-key record buckets with server-identity fallbacks, logs every
//! attributed query through the shared capture pipeline, and never lets the
//! store delay or fail a reply.

mod authority;

pub use authority::DnsAuthority;

//! # Echotrap Store
//!
//! The session and response store fusing the capture plane: keyed values
//! with TTL, append-only capture lists, pub/sub fan-out channels and a
//! distributed advisory lock, plus the per-subdomain keyspace facade the
//! resolver and HTTP engine share.
//!
//! The backend is an embedded sled keyspace; the primitive surface
//! (`get`/`set`/`delete`/`append`/`range`/`set_at`/`index_at`/`publish`/
//! `subscribe`/`try_lock`) is the whole contract, so a networked backend can
//! replace it without touching callers.

mod kv;
mod session;

pub use kv::{LockGuard, Store};
pub use session::{SessionStore, TOMBSTONE};

//! # courier-store
//!
//! SQLite-backed persistence for Courier: sessions, pairing codes,
//! per-user settings, and stats snapshots.

mod store;

pub use store::{Store, UserSettings, PAIRING_CODE_TTL_SECS, SESSION_TTL_SECS};

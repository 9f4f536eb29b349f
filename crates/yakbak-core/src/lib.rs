//! Core types, Nostr conversion, and shared utilities for the yakbak feed engine.
//!
//! This crate provides:
//! - Content-addressed identifiers ([`RecordId`], [`ParticipantId`]) and [`Endpoint`] keys
//! - The immutable [`Record`] model and the [`Filter`] query/predicate type
//! - Conversion from `nostr` events and to `nostr` filters
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
mod filter;
pub mod metrics;
mod record;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Root voice note (NIP-A0).
pub const VOICE_NOTE_KIND: u16 = 1222;

/// Voice reply to another voice note.
pub const VOICE_REPLY_KIND: u16 = 1244;

/// Contact list (NIP-02), the source of "following" selections.
pub const CONTACT_LIST_KIND: u16 = 3;

/// Relay list metadata (NIP-65), the source of outbox/inbox endpoints.
pub const RELAY_LIST_KIND: u16 = 10002;

pub use error::{Error, Result};
pub use event::{filter_to_nostr, record_from_event};
pub use filter::{Filter, parse_hashtags};
pub use record::{Endpoint, ParticipantId, Record, RecordId, Timestamp};

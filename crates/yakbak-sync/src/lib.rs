//! Feed synchronization for yakbak voice notes.
//!
//! This crate keeps a local, deduplicating record cache in step with a set of
//! Nostr relays and exposes one ordered, paginable feed per selection.
//!
//! # Modules
//!
//! - [`engine`] - Per-selection sessions: catch-up, live tail, pagination
//! - [`cache`] - SQLite record cache and key/value store
//! - [`watermark`] - Per-participant synced time ranges
//! - [`fanout`] - Parallel queries with per-endpoint failure isolation
//! - [`directory`] - Participant to endpoint resolution (NIP-65)
//! - [`transport`] - Relay queries and subscriptions
//! - [`view`] - The feed a UI holds across selection changes
//! - [`replies`] / [`notifications`] - Thread and inbox loading
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    FeedView     │  selection changes, show more
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   FeedSession   │────▶│ EndpointDirectory│  outbox relays per participant
//! └────────┬────────┘     └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │     Fanout      │────▶│    Transport    │  nostr-sdk relay pool
//! └────────┬────────┘     └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   EventCache    │  SQLite, dedupes by id, holds watermarks
//! └─────────────────┘
//! ```
//!
//! The cache is the source of truth for what has been seen; the merge window
//! of a session is a view over it.

pub mod cache;
pub mod clock;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod notifications;
pub mod relay_url;
pub mod replies;
pub mod selection;
pub mod transport;
pub mod view;
pub mod watermark;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

pub use cache::{EventCache, InsertOutcome, KvStore, SqliteEventCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use directory::{EndpointDirectory, OutboxDirectory, RelayList, StaticDirectory};
pub use engine::{EngineDeps, FeedSession, FeedStatus, FeedUpdate, Phase, SyncEngine};
pub use fanout::{Fanout, FanoutResult};
pub use notifications::{Notification, NotificationCenter};
pub use replies::ThreadLoader;
pub use selection::{Selection, Source};
pub use transport::nostr::{NostrTransport, NostrTransportConfig};
pub use transport::{StreamItem, Subscription, Transport};
pub use view::FeedView;
pub use watermark::{Watermark, WatermarkTable};

//! Network transport abstraction.
//!
//! A [`Transport`] answers two questions against relays: "give me the stored
//! records matching this filter" (one endpoint at a time, until end of stored
//! data) and "keep telling me about matching records" (a [`Subscription`]
//! over many endpoints). The engine never sees protocol details.

pub mod nostr;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use yakbak_core::{Endpoint, Filter, Record};

use crate::Result;

pub use self::nostr::NostrTransport;

/// Relay access used by the fan-out and the engine.
pub trait Transport: Send + Sync {
    /// Stored records on one endpoint matching `filter`, complete once the
    /// endpoint signals end-of-stored-data.
    fn query<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<Record>>>;

    /// Open one subscription across `endpoints`.
    fn subscribe<'a>(
        &'a self,
        endpoints: &'a [Endpoint],
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Subscription>>;
}

/// One item delivered by a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Record { endpoint: Endpoint, record: Record },
    /// The endpoint has delivered everything it had stored.
    EndOfStored { endpoint: Endpoint },
    /// The endpoint refused or dropped the subscription.
    Closed { endpoint: Endpoint, reason: String },
}

impl StreamItem {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Self::Record { endpoint, .. }
            | Self::EndOfStored { endpoint }
            | Self::Closed { endpoint, .. } => endpoint,
        }
    }
}

/// Idempotent handle that ends a subscription.
#[derive(Debug, Clone, Default)]
pub struct Closer(CancellationToken);

impl Closer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the subscription. Calling this more than once is a no-op.
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once [`Closer::close`] has been called.
    pub async fn closed(&self) {
        self.0.cancelled().await
    }
}

/// A live stream of [`StreamItem`]s. Dropping it closes it.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<StreamItem>,
    closer: Closer,
}

impl Subscription {
    /// Build a subscription fed by `rx`. The producer must stop when `closer`
    /// is closed.
    pub fn new(rx: mpsc::Receiver<StreamItem>, closer: Closer) -> Self {
        Self { rx, closer }
    }

    /// Next item, or `None` once the stream has ended or been closed.
    pub async fn next(&mut self) -> Option<StreamItem> {
        if self.closer.is_closed() {
            return None;
        }
        tokio::select! {
            item = self.rx.recv() => item,
            _ = self.closer.closed() => None,
        }
    }

    pub fn closer(&self) -> Closer {
        self.closer.clone()
    }

    pub fn close(&self) {
        self.closer.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closer.close();
    }
}

//! [`Transport`] over a nostr-sdk relay pool.
//!
//! # Architecture
//!
//! One `Client` owns every relay connection. Relays are added lazily the
//! first time an endpoint is used. Stored queries go through
//! `fetch_events_from`; subscriptions read the pool's notification broadcast
//! and forward the items that belong to their subscription id into a
//! bounded channel.
//!
//! Events are signature-checked by nostr-sdk before they reach us.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use nostr_sdk::prelude::*;
use tokio::sync::{broadcast, mpsc};
use yakbak_core::{Endpoint, Filter, Record, filter_to_nostr, record_from_event};

use super::{Closer, StreamItem, Subscription, Transport};
use crate::{Error, Result};

/// Configuration for the relay pool transport.
#[derive(Debug, Clone)]
pub struct NostrTransportConfig {
    /// Upper bound for one stored query. Fan-out deadlines are usually shorter.
    pub fetch_timeout: Duration,

    /// Size of the pool's notification broadcast buffer.
    pub notification_channel_size: usize,

    /// Buffer between the notification reader and a [`Subscription`].
    pub stream_buffer: usize,
}

impl Default for NostrTransportConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            notification_channel_size: 4096,
            stream_buffer: 1024,
        }
    }
}

pub struct NostrTransport {
    client: Client,
    config: NostrTransportConfig,
}

impl NostrTransport {
    pub fn new(config: NostrTransportConfig) -> Self {
        // Ephemeral keys, only used to answer NIP-42 auth challenges.
        let keys = Keys::generate();

        let pool_opts =
            RelayPoolOptions::default().notification_channel_size(config.notification_channel_size);
        let client = Client::builder()
            .signer(keys)
            .opts(ClientOptions::new().pool(pool_opts))
            .build();
        client.automatic_authentication(true);

        Self { client, config }
    }

    /// Disconnect from every relay.
    pub async fn shutdown(&self) {
        self.client.disconnect().await;
    }

    async fn ensure_relay(&self, endpoint: &Endpoint) -> Result<RelayUrl> {
        let url = RelayUrl::parse(endpoint.as_str()).map_err(|e| Error::EndpointUnavailable {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        if self.client.add_relay(url.clone()).await? {
            tracing::debug!("Added relay: {}", url);
        }
        self.client.connect_relay(url.clone()).await?;

        Ok(url)
    }

    async fn fetch(&self, endpoint: &Endpoint, filter: &Filter) -> Result<Vec<Record>> {
        let url = self.ensure_relay(endpoint).await?;
        let events = self
            .client
            .fetch_events_from(vec![url], filter_to_nostr(filter), self.config.fetch_timeout)
            .await?;

        Ok(events.into_iter().map(|event| record_from_event(&event)).collect())
    }

    async fn open(&self, endpoints: &[Endpoint], filter: &Filter) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        let closer = Closer::new();

        let mut urls = Vec::with_capacity(endpoints.len());
        let mut unavailable = Vec::new();
        for endpoint in endpoints {
            match self.ensure_relay(endpoint).await {
                Ok(url) => urls.push(url),
                Err(e) => {
                    tracing::debug!("Cannot subscribe on {}: {}", endpoint, e);
                    unavailable.push(StreamItem::Closed {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if urls.is_empty() {
            return Err(Error::AllEndpointsFailed {
                attempted: endpoints.len(),
            });
        }

        // Listen before subscribing so no early event is missed.
        let notifications = self.client.notifications();
        let output = self
            .client
            .subscribe_to(urls, filter_to_nostr(filter), None)
            .await?;
        let subscription_id = output.val;

        for (url, reason) in output.failed {
            unavailable.push(StreamItem::Closed {
                endpoint: endpoint_of(&url),
                reason,
            });
        }
        for item in unavailable {
            if tx.try_send(item).is_err() {
                break;
            }
        }

        tokio::spawn(forward_notifications(
            self.client.clone(),
            notifications,
            subscription_id,
            tx,
            closer.clone(),
        ));

        Ok(Subscription::new(rx, closer))
    }
}

impl Transport for NostrTransport {
    fn query<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<Record>>> {
        self.fetch(endpoint, filter).boxed()
    }

    fn subscribe<'a>(
        &'a self,
        endpoints: &'a [Endpoint],
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Subscription>> {
        self.open(endpoints, filter).boxed()
    }
}

fn endpoint_of(url: &RelayUrl) -> Endpoint {
    Endpoint::new(url.to_string().trim_end_matches('/'))
}

async fn forward_notifications(
    client: Client,
    mut notifications: broadcast::Receiver<RelayPoolNotification>,
    subscription_id: SubscriptionId,
    tx: mpsc::Sender<StreamItem>,
    closer: Closer,
) {
    loop {
        let notification = tokio::select! {
            _ = closer.closed() => break,
            n = notifications.recv() => n,
        };

        let item = match notification {
            Ok(RelayPoolNotification::Event {
                relay_url,
                subscription_id: id,
                event,
            }) if id == subscription_id => StreamItem::Record {
                endpoint: endpoint_of(&relay_url),
                record: record_from_event(&event),
            },
            Ok(RelayPoolNotification::Message { relay_url, message }) => match message {
                RelayMessage::EndOfStoredEvents(id) if id.as_ref() == &subscription_id => {
                    StreamItem::EndOfStored {
                        endpoint: endpoint_of(&relay_url),
                    }
                }
                RelayMessage::Closed {
                    subscription_id: id,
                    message,
                } if id.as_ref() == &subscription_id => StreamItem::Closed {
                    endpoint: endpoint_of(&relay_url),
                    reason: message.to_string(),
                },
                _ => continue,
            },
            Ok(RelayPoolNotification::Shutdown) => {
                tracing::info!("Relay pool shutdown notification received");
                break;
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                metrics::counter!("live_notifications_lagged_total").increment(count);
                tracing::warn!("Subscription {} lagged, dropped {} notifications", subscription_id, count);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if tx.send(item).await.is_err() {
            break;
        }
    }

    closer.close();
    client.unsubscribe(&subscription_id).await;
    tracing::debug!("Subscription {} closed", subscription_id);
}

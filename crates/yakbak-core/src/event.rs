//! Conversion between the `nostr` crate's types and yakbak's own.
//!
//! Events arriving through nostr-sdk have already had their id and signature
//! verified by the relay pool, so conversion into a [`Record`] is infallible.

use nostr::{EventId, Kind, PublicKey, SingleLetterTag};

use crate::filter::Filter;
use crate::record::{ParticipantId, Record, RecordId, Timestamp};

/// Convert a verified `nostr::Event` into a [`Record`].
pub fn record_from_event(event: &nostr::Event) -> Record {
    Record {
        id: RecordId::from_bytes(*event.id.as_bytes()),
        author: ParticipantId::from_bytes(*event.pubkey.as_bytes()),
        created_at: Timestamp::try_from(event.created_at.as_u64()).unwrap_or(Timestamp::MAX),
        kind: event.kind.as_u16(),
        tags: event
            .tags
            .iter()
            .map(|tag| tag.as_slice().iter().map(|s| s.to_string()).collect())
            .collect(),
        content: event.content.clone(),
    }
}

/// Build the wire filter for a [`Filter`].
///
/// Tag letters that are not valid single-letter tags are dropped, as are
/// authors that are not valid x-only keys. Negative timestamps clamp to zero.
pub fn filter_to_nostr(filter: &Filter) -> nostr::Filter {
    let mut out = nostr::Filter::new();

    if let Some(ids) = &filter.ids {
        out = out.ids(ids.iter().map(|id| EventId::from_byte_array(*id.as_bytes())));
    }
    if let Some(authors) = &filter.authors {
        let keys: Vec<PublicKey> = authors
            .iter()
            .filter_map(|a| PublicKey::from_slice(a.as_bytes()).ok())
            .collect();
        out = out.authors(keys);
    }
    if let Some(kinds) = &filter.kinds {
        out = out.kinds(kinds.iter().map(|k| Kind::from(*k)));
    }
    for (letter, values) in &filter.tags {
        if let Ok(tag) = SingleLetterTag::from_char(*letter) {
            out = out.custom_tags(tag, values.iter().cloned());
        }
    }
    if let Some(since) = filter.since {
        out = out.since(nostr::Timestamp::from(since.max(0) as u64));
    }
    if let Some(until) = filter.until {
        out = out.until(nostr::Timestamp::from(until.max(0) as u64));
    }
    if let Some(limit) = filter.limit {
        out = out.limit(limit);
    }

    out
}

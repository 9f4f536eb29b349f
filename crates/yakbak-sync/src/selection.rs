//! Feed selections.
//!
//! A [`Selection`] says which records a feed shows: either everything a set
//! of participants wrote (matching a base filter), or everything a fixed set
//! of relays carries (relay-set mode). It is immutable for one session.

use std::collections::BTreeSet;

use yakbak_core::{CONTACT_LIST_KIND, Endpoint, Filter, ParticipantId, Record, VOICE_NOTE_KIND};

use crate::relay_url::normalize_user_relay;

/// Relays backing the global and hashtag feeds.
pub const GLOBAL_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://nostr.wine",
    "wss://relay.nostr.band",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Participants(Vec<ParticipantId>),
    Relays(Vec<Endpoint>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Human readable name, used in logs and the CLI.
    pub label: String,
    pub source: Source,
    pub base: Filter,
    /// Only thread roots (records referencing no other record) belong to the feed.
    pub roots_only: bool,
}

impl Selection {
    pub fn participants(
        label: impl Into<String>,
        participants: impl IntoIterator<Item = ParticipantId>,
        base: Filter,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let participants = participants
            .into_iter()
            .filter(|p| seen.insert(*p))
            .collect();
        Self {
            label: label.into(),
            source: Source::Participants(participants),
            base,
            roots_only: false,
        }
    }

    pub fn relays(
        label: impl Into<String>,
        endpoints: impl IntoIterator<Item = Endpoint>,
        base: Filter,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let endpoints = endpoints
            .into_iter()
            .filter(|e| seen.insert(e.clone()))
            .collect();
        Self {
            label: label.into(),
            source: Source::Relays(endpoints),
            base,
            roots_only: false,
        }
    }

    /// Restrict the feed to thread roots.
    pub fn roots_only(mut self) -> Self {
        self.roots_only = true;
        self
    }

    /// Root voice notes from the global relays.
    pub fn global() -> Self {
        Self::relays("Global", global_relays(), voice_notes()).roots_only()
    }

    /// Root voice notes tagged with any of `hashtags`, from the global relays.
    pub fn hashtag(hashtags: &[String]) -> Self {
        let label = hashtags
            .iter()
            .map(|t| format!("#{t}"))
            .collect::<Vec<_>>()
            .join(" ");
        let base = voice_notes().tag('t', hashtags.iter().map(|t| t.to_lowercase()));
        Self::relays(label, global_relays(), base).roots_only()
    }

    /// Root voice notes from one relay. A bare host gets `wss://`.
    pub fn relay(host: &str) -> Option<Self> {
        let endpoint = normalize_user_relay(host)?;
        let label = crate::relay_url::pretty_relay_url(endpoint.as_str());
        Some(Self::relays(label, [endpoint], voice_notes()).roots_only())
    }

    /// Root voice notes written by one participant.
    pub fn profile(participant: ParticipantId) -> Self {
        Self::participants(participant.short(), [participant], voice_notes()).roots_only()
    }

    /// Root voice notes from everyone in a contact list (kind:3 `p` tags).
    pub fn following(contact_list: &Record) -> Self {
        let follows: Vec<ParticipantId> = if contact_list.kind == CONTACT_LIST_KIND {
            contact_list
                .tag_values("p")
                .filter_map(|v| ParticipantId::from_hex(v).ok())
                .collect()
        } else {
            Vec::new()
        };
        Self::participants("Following", follows, voice_notes()).roots_only()
    }

    pub fn is_relay_set(&self) -> bool {
        matches!(self.source, Source::Relays(_))
    }

    /// Participants of a participant-set selection; empty in relay-set mode.
    pub fn participant_list(&self) -> &[ParticipantId] {
        match &self.source {
            Source::Participants(p) => p,
            Source::Relays(_) => &[],
        }
    }

    /// Whether `record` belongs to this feed.
    pub fn accepts(&self, record: &Record) -> bool {
        if self.roots_only && !record.is_root() {
            return false;
        }
        if let Source::Participants(participants) = &self.source
            && !participants.contains(&record.author)
        {
            return false;
        }
        self.base.matches(record)
    }

    /// Query for `participants` built on the base filter.
    pub fn filter_for(&self, participants: &[ParticipantId]) -> Filter {
        self.base.clone().with_authors(participants.iter().copied())
    }

    /// Query covering the whole selection.
    pub fn selection_filter(&self) -> Filter {
        match &self.source {
            Source::Participants(p) => self.filter_for(p),
            Source::Relays(_) => self.base.clone(),
        }
    }
}

fn voice_notes() -> Filter {
    Filter::new().kind(VOICE_NOTE_KIND)
}

fn global_relays() -> Vec<Endpoint> {
    GLOBAL_RELAYS.iter().map(|url| Endpoint::new(*url)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{note, participant, record, reply_to};

    #[test]
    fn test_global_is_relay_set_of_roots() {
        let global = Selection::global();
        assert!(global.is_relay_set());
        assert!(global.participant_list().is_empty());

        let root = note(1, 1, 100);
        let reply = reply_to(2, 1, 200, &root);
        assert!(global.accepts(&root));
        assert!(!global.accepts(&reply));
        assert!(!global.accepts(&record(3, 1, 300, 1)));
    }

    #[test]
    fn test_hashtag_filter() {
        let selection = Selection::hashtag(&["Music".to_string()]);
        assert_eq!(selection.label, "#Music");
        let mut tagged = note(1, 1, 100);
        tagged.tags.push(vec!["t".to_string(), "music".to_string()]);
        assert!(selection.accepts(&tagged));
        assert!(!selection.accepts(&note(2, 1, 100)));
    }

    #[test]
    fn test_relay_selection_normalizes_host() {
        let selection = Selection::relay("nos.lol/").unwrap();
        assert_eq!(selection.source, Source::Relays(vec![Endpoint::new("wss://nos.lol")]));
        assert_eq!(selection.label, "nos.lol");
        assert!(Selection::relay("").is_none());
    }

    #[test]
    fn test_relays_dedupe_non_adjacent() {
        let (a, b) = (Endpoint::new("wss://a.example"), Endpoint::new("wss://b.example"));
        let selection = Selection::relays("mixed", [a.clone(), b.clone(), a.clone()], Filter::new());
        assert_eq!(selection.source, Source::Relays(vec![a, b]));
    }

    #[test]
    fn test_profile_accepts_only_author() {
        let selection = Selection::profile(participant(1));
        assert!(selection.accepts(&note(1, 1, 100)));
        assert!(!selection.accepts(&note(2, 2, 100)));
        assert_eq!(
            selection.filter_for(&[participant(1)]).authors,
            Some(BTreeSet::from([participant(1)]))
        );
    }

    #[test]
    fn test_following_reads_contact_list() {
        let mut contacts = record(9, 7, 100, CONTACT_LIST_KIND);
        contacts.tags = vec![
            vec!["p".to_string(), participant(1).to_hex()],
            vec!["p".to_string(), participant(2).to_hex()],
            vec!["p".to_string(), participant(1).to_hex()],
            vec!["p".to_string(), "garbage".to_string()],
        ];
        let selection = Selection::following(&contacts);
        assert_eq!(selection.participant_list(), &[participant(1), participant(2)]);

        let not_contacts = record(10, 7, 100, 1);
        assert!(Selection::following(&not_contacts).participant_list().is_empty());
    }
}

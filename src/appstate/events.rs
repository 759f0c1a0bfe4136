//! Domain-level events materialized from applied mutations.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::proto::{SyncActionValue, SyncdOperation};

use super::patch::DecodedMutation;
use super::Collection;

/// What a mutation means for the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppStateEvent {
    Mute {
        chat: String,
        muted: bool,
        until: Option<i64>,
    },
    Pin {
        chat: String,
        pinned: bool,
    },
    Archive {
        chat: String,
        archived: bool,
    },
    Star {
        chat: String,
        message_id: String,
        starred: bool,
    },
    Contact {
        jid: String,
        full_name: Option<String>,
        first_name: Option<String>,
    },
    MarkRead {
        chat: String,
        read: bool,
    },
    /// The entry at the index was removed.
    Removed,
    /// An action this crate does not interpret.
    Other,
}

/// One net mutation of a collection, forwarded to the [`MutationSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStateMutation {
    pub index: Vec<String>,
    pub timestamp: Option<i64>,
    pub event: AppStateEvent,
}

impl AppStateMutation {
    /// `None` for mutations whose key was unavailable.
    pub(crate) fn from_decoded(mutation: &DecodedMutation) -> Option<Self> {
        let index = mutation.index.clone()?;
        let value = mutation.value.as_ref();
        let event = match mutation.operation {
            SyncdOperation::Remove => AppStateEvent::Removed,
            SyncdOperation::Set => interpret(&index, value),
        };
        Some(Self {
            timestamp: value.and_then(|v| v.timestamp),
            index,
            event,
        })
    }
}

fn interpret(index: &[String], value: Option<&SyncActionValue>) -> AppStateEvent {
    let (Some(kind), Some(value)) = (index.first(), value) else {
        return AppStateEvent::Other;
    };
    let arg = |i: usize| index.get(i).cloned().unwrap_or_default();
    match kind.as_str() {
        "mute" => value.mute_action.as_ref().map(|a| AppStateEvent::Mute {
            chat: arg(1),
            muted: a.muted.unwrap_or_default(),
            until: a.mute_end_timestamp,
        }),
        "pin_v1" => value.pin_action.as_ref().map(|a| AppStateEvent::Pin {
            chat: arg(1),
            pinned: a.pinned.unwrap_or_default(),
        }),
        "archive" => value.archive_chat_action.as_ref().map(|a| AppStateEvent::Archive {
            chat: arg(1),
            archived: a.archived.unwrap_or_default(),
        }),
        "star" => value.star_action.as_ref().map(|a| AppStateEvent::Star {
            chat: arg(1),
            message_id: arg(2),
            starred: a.starred.unwrap_or_default(),
        }),
        "contact" => value.contact_action.as_ref().map(|a| AppStateEvent::Contact {
            jid: arg(1),
            full_name: a.full_name.clone(),
            first_name: a.first_name.clone(),
        }),
        "markChatAsRead" => value.mark_chat_as_read_action.as_ref().map(|a| AppStateEvent::MarkRead {
            chat: arg(1),
            read: a.read.unwrap_or_default(),
        }),
        _ => None,
    }
    .unwrap_or(AppStateEvent::Other)
}

/// External collaborator that stores the materialized app state.
pub trait MutationSink: Send + Sync {
    fn apply(&self, collection: Collection, mutation: &AppStateMutation);

    /// The collection is about to be rebuilt from a snapshot.
    fn reset(&self, _collection: Collection) {}
}

/// Sink that keeps the latest mutation per index.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<BTreeMap<(Collection, Vec<String>), AppStateMutation>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: Collection, index: &[&str]) -> Option<AppStateMutation> {
        let key: Vec<String> = index.iter().map(|s| s.to_string()).collect();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(collection, key))
            .cloned()
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(c, _)| *c == collection)
            .count()
    }
}

impl MutationSink for MemorySink {
    fn apply(&self, collection: Collection, mutation: &AppStateMutation) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (collection, mutation.index.clone());
        if mutation.event == AppStateEvent::Removed {
            entries.remove(&key);
        } else {
            entries.insert(key, mutation.clone());
        }
    }

    fn reset(&self, collection: Collection) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(c, _), _| *c != collection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ContactAction, PinAction};

    fn decoded(operation: SyncdOperation, index: &[&str], value: Option<SyncActionValue>) -> DecodedMutation {
        DecodedMutation {
            operation,
            index_mac: [0; 32],
            value_mac: [0; 32],
            key_id: b"k".to_vec(),
            index: Some(index.iter().map(|s| s.to_string()).collect()),
            value,
        }
    }

    #[test]
    fn test_interprets_known_actions() {
        let pin = SyncActionValue {
            timestamp: Some(10),
            pin_action: Some(PinAction { pinned: Some(true) }),
            ..Default::default()
        };
        let mutation = AppStateMutation::from_decoded(&decoded(SyncdOperation::Set, &["pin_v1", "1@s.whatsapp.net"], Some(pin))).unwrap();
        assert_eq!(mutation.timestamp, Some(10));
        assert_eq!(
            mutation.event,
            AppStateEvent::Pin {
                chat: "1@s.whatsapp.net".into(),
                pinned: true
            }
        );

        let contact = SyncActionValue {
            contact_action: Some(ContactAction {
                full_name: Some("Ada Lovelace".into()),
                first_name: Some("Ada".into()),
            }),
            ..Default::default()
        };
        let mutation = AppStateMutation::from_decoded(&decoded(SyncdOperation::Set, &["contact", "2@s.whatsapp.net"], Some(contact))).unwrap();
        assert!(matches!(mutation.event, AppStateEvent::Contact { ref first_name, .. } if first_name.as_deref() == Some("Ada")));
    }

    #[test]
    fn test_unknown_and_mismatched_actions_are_other() {
        let mutation = AppStateMutation::from_decoded(&decoded(
            SyncdOperation::Set,
            &["mute", "1"],
            Some(SyncActionValue::default()),
        ))
        .unwrap();
        assert_eq!(mutation.event, AppStateEvent::Other);

        let mutation =
            AppStateMutation::from_decoded(&decoded(SyncdOperation::Set, &["setting_pushName"], Some(SyncActionValue::default())))
                .unwrap();
        assert_eq!(mutation.event, AppStateEvent::Other);
    }

    #[test]
    fn test_undecrypted_mutation_is_not_materialized() {
        let mut mutation = decoded(SyncdOperation::Set, &["mute", "1"], None);
        mutation.index = None;
        assert_eq!(AppStateMutation::from_decoded(&mutation), None);
    }

    #[test]
    fn test_memory_sink_removes_and_resets() {
        let sink = MemorySink::new();
        let set = AppStateMutation::from_decoded(&decoded(SyncdOperation::Set, &["archive", "1"], None)).unwrap();
        sink.apply(Collection::Regular, &set);
        sink.apply(Collection::RegularLow, &set);
        assert_eq!(sink.len(Collection::Regular), 1);

        let removed = AppStateMutation::from_decoded(&decoded(SyncdOperation::Remove, &["archive", "1"], None)).unwrap();
        sink.apply(Collection::Regular, &removed);
        assert!(sink.get(Collection::Regular, &["archive", "1"]).is_none());

        sink.reset(Collection::RegularLow);
        assert_eq!(sink.len(Collection::RegularLow), 0);
    }
}

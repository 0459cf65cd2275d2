// Delta updates: partial state changes relative to the previous snapshot.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::model::{
    FunctionSpec, Interaction, InteractionKey, MessageTurn, Role, Snapshot, UiElement,
    WorldObject,
};

/// The keyed parts of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    MessageLog,
    ObjectsInView,
    UiElements,
    PlayerStatus,
    ActiveInteractions,
    AvailableFunctions,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::MessageLog => write!(f, "message_log"),
            Collection::PlayerStatus => write!(f, "player_status"),
            Collection::ObjectsInView => write!(f, "objects_in_view"),
            Collection::UiElements => write!(f, "ui_elements"),
            Collection::ActiveInteractions => write!(f, "active_interactions"),
            Collection::AvailableFunctions => write!(f, "available_functions"),
        }
    }
}

/// An entry of a keyed snapshot collection.
pub trait Keyed: Clone + PartialEq {
    type Key: Clone + Eq + Hash + fmt::Display;

    const COLLECTION: Collection;

    fn key(&self) -> Self::Key;
}

impl Keyed for MessageTurn {
    type Key = Role;
    const COLLECTION: Collection = Collection::MessageLog;

    fn key(&self) -> Role {
        self.role
    }
}

impl Keyed for WorldObject {
    type Key = String;
    const COLLECTION: Collection = Collection::ObjectsInView;

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Keyed for UiElement {
    type Key = String;
    const COLLECTION: Collection = Collection::UiElements;

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Keyed for FunctionSpec {
    type Key = String;
    const COLLECTION: Collection = Collection::AvailableFunctions;

    fn key(&self) -> String {
        self.name.clone()
    }
}

impl Keyed for Interaction {
    type Key = InteractionKey;
    const COLLECTION: Collection = Collection::ActiveInteractions;

    fn key(&self) -> InteractionKey {
        Interaction::key(self)
    }
}

/// `game_context` part of an added/updated section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextChanges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects_in_view: Vec<WorldObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ui_elements: Vec<UiElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_status: Option<Map<String, Value>>,
}

/// Added or updated entries, in the same shape as a full snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaSection {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_log: Vec<MessageTurn>,
    #[serde(default)]
    pub game_context: ContextChanges,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_interactions: Vec<Interaction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_functions: Vec<FunctionSpec>,
}

impl DeltaSection {
    pub fn is_empty(&self) -> bool {
        self.message_log.is_empty()
            && self.game_context.objects_in_view.is_empty()
            && self.game_context.ui_elements.is_empty()
            && self.game_context.player_status.is_none()
            && self.active_interactions.is_empty()
            && self.available_functions.is_empty()
    }
}

/// Player status removal: `true` drops the whole status object, a list drops
/// individual keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusRemoval {
    All(bool),
    Keys(Vec<String>),
}

impl StatusRemoval {
    pub fn is_empty(&self) -> bool {
        match self {
            StatusRemoval::All(all) => !all,
            StatusRemoval::Keys(keys) => keys.is_empty(),
        }
    }
}

/// `game_context` part of the removed section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemovedContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects_in_view: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ui_elements: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_status: Option<StatusRemoval>,
}

/// Ids to drop from the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemovedIds {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_log: Vec<Role>,
    #[serde(default)]
    pub game_context: RemovedContext,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_interactions: Vec<InteractionKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_functions: Vec<String>,
}

impl RemovedIds {
    pub fn is_empty(&self) -> bool {
        self.message_log.is_empty()
            && self.game_context.objects_in_view.is_empty()
            && self.game_context.ui_elements.is_empty()
            && self
                .game_context
                .player_status
                .as_ref()
                .map_or(true, StatusRemoval::is_empty)
            && self.active_interactions.is_empty()
            && self.available_functions.is_empty()
    }
}

/// A partial update relative to the session's previous snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub added: DeltaSection,
    #[serde(default)]
    pub removed: RemovedIds,
    #[serde(default)]
    pub updated: DeltaSection,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Compute the delta that turns `previous` into `current`.
    ///
    /// Changed entries go to `updated`, new entries to `added`, missing ones to
    /// `removed`. Entries whose position changed are removed and re-added so the
    /// merged order matches `current`.
    pub fn between(previous: &Snapshot, current: &Snapshot) -> Delta {
        let mut delta = Delta::default();

        let (added, updated, removed) = diff_collection(&previous.message_log, &current.message_log);
        delta.added.message_log = added;
        delta.updated.message_log = updated;
        delta.removed.message_log = removed;

        let (added, updated, removed) = diff_collection(
            &previous.game_context.objects_in_view,
            &current.game_context.objects_in_view,
        );
        delta.added.game_context.objects_in_view = added;
        delta.updated.game_context.objects_in_view = updated;
        delta.removed.game_context.objects_in_view = removed;

        let (added, updated, removed) = diff_collection(
            &previous.game_context.ui_elements,
            &current.game_context.ui_elements,
        );
        delta.added.game_context.ui_elements = added;
        delta.updated.game_context.ui_elements = updated;
        delta.removed.game_context.ui_elements = removed;

        let (added, updated, removed) =
            diff_collection(&previous.active_interactions, &current.active_interactions);
        delta.added.active_interactions = added;
        delta.updated.active_interactions = updated;
        delta.removed.active_interactions = removed;

        let (added, updated, removed) =
            diff_collection(&previous.available_functions, &current.available_functions);
        delta.added.available_functions = added;
        delta.updated.available_functions = updated;
        delta.removed.available_functions = removed;

        match (
            &previous.game_context.player_status,
            &current.game_context.player_status,
        ) {
            (None, None) => {}
            (None, Some(status)) => {
                delta.updated.game_context.player_status = Some(status.clone());
            }
            (Some(_), None) => {
                delta.removed.game_context.player_status = Some(StatusRemoval::All(true));
            }
            (Some(prev), Some(status)) => {
                let dropped: Vec<String> = prev
                    .keys()
                    .filter(|k| !status.contains_key(*k))
                    .cloned()
                    .collect();
                if !dropped.is_empty() {
                    delta.removed.game_context.player_status = Some(StatusRemoval::Keys(dropped));
                }
                let changed: Map<String, Value> = status
                    .iter()
                    .filter(|(k, v)| prev.get(*k) != Some(*v))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if !changed.is_empty() {
                    delta.updated.game_context.player_status = Some(changed);
                }
            }
        }

        delta
    }
}

/// Diff one keyed collection into `(added, updated, removed)`.
///
/// The entries kept in place are the longest prefix of `current` that appears in
/// the same relative order in `previous`. Everything after that prefix is added,
/// and previous entries outside it are removed.
fn diff_collection<T: Keyed>(previous: &[T], current: &[T]) -> (Vec<T>, Vec<T>, Vec<T::Key>) {
    let prev_index: HashMap<T::Key, usize> = previous
        .iter()
        .enumerate()
        .map(|(i, e)| (e.key(), i))
        .collect();

    let mut last = None;
    let kept = current
        .iter()
        .take_while(|entry| match prev_index.get(&entry.key()) {
            Some(&i) if last.map_or(true, |l| i > l) => {
                last = Some(i);
                true
            }
            _ => false,
        })
        .count();

    let updated = current[..kept]
        .iter()
        .filter(|entry| previous[prev_index[&entry.key()]] != **entry)
        .cloned()
        .collect();
    let added = current[kept..].to_vec();

    let kept_keys: HashSet<T::Key> = current[..kept].iter().map(Keyed::key).collect();
    let removed = previous
        .iter()
        .map(Keyed::key)
        .filter(|k| !kept_keys.contains(k))
        .collect();

    (added, updated, removed)
}

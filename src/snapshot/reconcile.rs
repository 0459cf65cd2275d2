// Reconciliation: merges an incoming full snapshot or delta into the canonical
// snapshot for a session.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::delta::{Collection, Delta, Keyed, StatusRemoval};
use super::model::{GameContext, InteractionKind, MessageTurn, Role, Snapshot};

/// An incoming update from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Full(Snapshot),
    Delta(Delta),
}

impl Update {
    /// Label used in logs and metrics.
    pub fn mode(&self) -> &'static str {
        match self {
            Update::Full(_) => "full",
            Update::Delta(_) => "delta",
        }
    }
}

/// A request-fatal reconciliation failure. The session cache is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("delta received with no prior session state; resend a full snapshot")]
    MissingBaseState,
    #[error("{collection} entry '{id}' does not exist in the previous state")]
    UnknownReference { collection: Collection, id: String },
    #[error("duplicate {collection} id '{id}'")]
    DuplicateId { collection: Collection, id: String },
    #[error("{collection} entry '{id}' is both removed and updated")]
    ConflictingChange { collection: Collection, id: String },
}

impl ReconcileError {
    /// Stable snake_case name for API responses and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::MissingBaseState => "missing_base_state",
            ReconcileError::UnknownReference { .. } => "unknown_reference",
            ReconcileError::DuplicateId { .. } => "duplicate_id",
            ReconcileError::ConflictingChange { .. } => "conflicting_change",
        }
    }
}

/// A recoverable problem found during reconciliation. The merge still succeeds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum ReconcileWarning {
    /// The interaction was dropped because its target is not in view.
    DanglingInteractionTarget { kind: InteractionKind, target: String },
    /// An `updated` entry lost to an `added` entry with the same id.
    SupersededUpdate { collection: Collection, id: String },
}

/// Result of a successful reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub snapshot: Snapshot,
    pub warnings: Vec<ReconcileWarning>,
}

/// Produce the new canonical snapshot from the previous one and an incoming update.
pub fn reconcile(
    previous: Option<&Snapshot>,
    incoming: Update,
) -> Result<Reconciled, ReconcileError> {
    let mut warnings = Vec::new();

    let mut snapshot = match incoming {
        Update::Full(snapshot) => {
            check_unique(&snapshot.game_context.objects_in_view)?;
            check_unique(&snapshot.game_context.ui_elements)?;
            check_unique(&snapshot.active_interactions)?;
            check_unique(&snapshot.available_functions)?;
            snapshot
        }
        Update::Delta(delta) => {
            let base = previous.ok_or(ReconcileError::MissingBaseState)?;
            apply_delta(base, delta, &mut warnings)?
        }
    };

    snapshot.normalize_message_log();
    drop_dangling_interactions(&mut snapshot, &mut warnings);

    Ok(Reconciled { snapshot, warnings })
}

fn apply_delta(
    base: &Snapshot,
    delta: Delta,
    warnings: &mut Vec<ReconcileWarning>,
) -> Result<Snapshot, ReconcileError> {
    let Delta {
        added,
        removed,
        updated,
    } = delta;

    let objects_in_view = merge_collection(
        &base.game_context.objects_in_view,
        added.game_context.objects_in_view,
        &removed.game_context.objects_in_view,
        updated.game_context.objects_in_view,
        warnings,
    )?;
    let ui_elements = merge_collection(
        &base.game_context.ui_elements,
        added.game_context.ui_elements,
        &removed.game_context.ui_elements,
        updated.game_context.ui_elements,
        warnings,
    )?;
    let active_interactions = merge_collection(
        &base.active_interactions,
        added.active_interactions,
        &removed.active_interactions,
        updated.active_interactions,
        warnings,
    )?;
    let available_functions = merge_collection(
        &base.available_functions,
        added.available_functions,
        &removed.available_functions,
        updated.available_functions,
        warnings,
    )?;

    let player_status = merge_status(
        base.game_context.player_status.as_ref(),
        removed.game_context.player_status,
        updated.game_context.player_status,
        added.game_context.player_status,
    )?;
    let message_log = merge_turns(
        &base.message_log,
        added.message_log,
        &removed.message_log,
        updated.message_log,
        warnings,
    )?;

    Ok(Snapshot {
        message_log,
        game_context: GameContext {
            objects_in_view,
            ui_elements,
            player_status,
        },
        active_interactions,
        available_functions,
    })
}

/// Merge the message log. Turns are keyed by role; an `updated` turn may
/// introduce a role the previous log did not have.
fn merge_turns(
    previous: &[MessageTurn],
    added: Vec<MessageTurn>,
    removed: &[Role],
    updated: Vec<MessageTurn>,
    warnings: &mut Vec<ReconcileWarning>,
) -> Result<Vec<MessageTurn>, ReconcileError> {
    let collection = Collection::MessageLog;
    let added_roles: HashSet<Role> = added.iter().map(|t| t.role).collect();
    let updated_roles: HashSet<Role> = updated.iter().map(|t| t.role).collect();

    for role in removed {
        if added_roles.contains(role) {
            continue;
        }
        if !previous.iter().any(|t| t.role == *role) {
            return Err(ReconcileError::UnknownReference {
                collection,
                id: role.to_string(),
            });
        }
        if updated_roles.contains(role) {
            return Err(ReconcileError::ConflictingChange {
                collection,
                id: role.to_string(),
            });
        }
    }

    let mut merged = Snapshot {
        message_log: previous
            .iter()
            .filter(|t| !removed.contains(&t.role) && !added_roles.contains(&t.role))
            .cloned()
            .collect(),
        ..Default::default()
    };
    for turn in updated {
        if added_roles.contains(&turn.role) {
            warnings.push(ReconcileWarning::SupersededUpdate {
                collection,
                id: turn.role.to_string(),
            });
            continue;
        }
        merged.set_turn(turn);
    }
    for turn in added {
        merged.set_turn(turn);
    }

    Ok(merged.message_log)
}

/// Merge one keyed collection. Final membership is `(previous - removed) + added`;
/// surviving entries keep their positions, added entries are appended in delta order.
fn merge_collection<T: Keyed>(
    previous: &[T],
    added: Vec<T>,
    removed: &[T::Key],
    updated: Vec<T>,
    warnings: &mut Vec<ReconcileWarning>,
) -> Result<Vec<T>, ReconcileError> {
    let collection = T::COLLECTION;
    let prev_keys: HashSet<T::Key> = previous.iter().map(Keyed::key).collect();

    let mut added_keys = HashSet::new();
    for entry in &added {
        let key = entry.key();
        if !added_keys.insert(key.clone()) {
            return Err(ReconcileError::DuplicateId {
                collection,
                id: key.to_string(),
            });
        }
    }

    let removed_keys: HashSet<&T::Key> = removed.iter().collect();
    for key in removed {
        // A remove for an id that is re-added in the same delta is stale but harmless.
        if !prev_keys.contains(key) && !added_keys.contains(key) {
            return Err(ReconcileError::UnknownReference {
                collection,
                id: key.to_string(),
            });
        }
    }

    let updated_keys: HashSet<T::Key> = updated.iter().map(Keyed::key).collect();
    let mut replacements: HashMap<T::Key, T> = HashMap::new();
    for entry in updated {
        let key = entry.key();
        if added_keys.contains(&key) {
            warnings.push(ReconcileWarning::SupersededUpdate {
                collection,
                id: key.to_string(),
            });
            continue;
        }
        if !prev_keys.contains(&key) {
            return Err(ReconcileError::UnknownReference {
                collection,
                id: key.to_string(),
            });
        }
        if removed_keys.contains(&key) {
            return Err(ReconcileError::ConflictingChange {
                collection,
                id: key.to_string(),
            });
        }
        if replacements.insert(key.clone(), entry).is_some() {
            return Err(ReconcileError::DuplicateId {
                collection,
                id: key.to_string(),
            });
        }
    }

    for entry in &added {
        let key = entry.key();
        if prev_keys.contains(&key) && !removed_keys.contains(&key) && !updated_keys.contains(&key)
        {
            return Err(ReconcileError::DuplicateId {
                collection,
                id: key.to_string(),
            });
        }
    }

    let mut merged: Vec<T> = previous
        .iter()
        .filter(|e| {
            let key = e.key();
            !removed_keys.contains(&key) && !added_keys.contains(&key)
        })
        .map(|e| replacements.remove(&e.key()).unwrap_or_else(|| e.clone()))
        .collect();
    merged.extend(added);

    Ok(merged)
}

/// Merge player status. Removals apply first, then `updated` and `added` keys
/// overwrite (added wins on collisions).
fn merge_status(
    previous: Option<&Map<String, Value>>,
    removed: Option<StatusRemoval>,
    updated: Option<Map<String, Value>>,
    added: Option<Map<String, Value>>,
) -> Result<Option<Map<String, Value>>, ReconcileError> {
    let collection = Collection::PlayerStatus;
    let mut status = previous.cloned();

    match removed {
        None | Some(StatusRemoval::All(false)) => {}
        Some(StatusRemoval::All(true)) => status = None,
        Some(StatusRemoval::Keys(keys)) => {
            let in_added = |key: &str| added.as_ref().is_some_and(|m| m.contains_key(key));
            let in_updated = |key: &str| updated.as_ref().is_some_and(|m| m.contains_key(key));
            for key in keys {
                if in_added(&key) {
                    continue;
                }
                if in_updated(&key) {
                    return Err(ReconcileError::ConflictingChange {
                        collection,
                        id: key,
                    });
                }
                if status.as_mut().and_then(|s| s.remove(&key)).is_none() {
                    return Err(ReconcileError::UnknownReference {
                        collection,
                        id: key,
                    });
                }
            }
        }
    }

    if updated.is_none() && added.is_none() {
        return Ok(status);
    }
    let mut status = status.unwrap_or_default();
    for (key, value) in updated.into_iter().chain(added).flatten() {
        status.insert(key, value);
    }
    Ok(Some(status))
}

fn check_unique<T: Keyed>(entries: &[T]) -> Result<(), ReconcileError> {
    let mut seen = HashSet::new();
    for entry in entries {
        let key = entry.key();
        if !seen.insert(key.clone()) {
            return Err(ReconcileError::DuplicateId {
                collection: T::COLLECTION,
                id: key.to_string(),
            });
        }
    }
    Ok(())
}

fn drop_dangling_interactions(snapshot: &mut Snapshot, warnings: &mut Vec<ReconcileWarning>) {
    let targets: HashSet<String> = snapshot.target_ids().into_iter().map(String::from).collect();
    snapshot.active_interactions.retain(|interaction| {
        if targets.contains(&interaction.target) {
            return true;
        }
        warnings.push(ReconcileWarning::DanglingInteractionTarget {
            kind: interaction.kind.clone(),
            target: interaction.target.clone(),
        });
        false
    });
}

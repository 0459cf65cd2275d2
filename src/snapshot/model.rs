// Snapshot data model: the full-state shape exchanged with game clients and
// handed to the inference provider.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Speaker of a message turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One chat turn. Only the latest turn per role is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTurn {
    pub role: Role,
    pub text: String,
}

/// A scalar attribute value. Nested values are not allowed in attribute maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

/// An object the player can currently see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A UI element, addressed by a stable path-like id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiElement {
    pub id: String,
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(default)]
    pub state: BTreeMap<String, Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// How the player is engaging with a target. Unknown kinds are carried through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InteractionKind {
    Gaze,
    Select,
    Holding,
    UiFocus,
    Other(String),
}

impl From<String> for InteractionKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "gaze" => InteractionKind::Gaze,
            "select" => InteractionKind::Select,
            "holding" => InteractionKind::Holding,
            "ui_focus" => InteractionKind::UiFocus,
            _ => InteractionKind::Other(s),
        }
    }
}

impl From<InteractionKind> for String {
    fn from(kind: InteractionKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractionKind::Gaze => write!(f, "gaze"),
            InteractionKind::Select => write!(f, "select"),
            InteractionKind::Holding => write!(f, "holding"),
            InteractionKind::UiFocus => write!(f, "ui_focus"),
            InteractionKind::Other(s) => write!(f, "{s}"),
        }
    }
}

/// An active interaction. `target` names a WorldObject or UiElement id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: InteractionKind,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

/// Identity of an interaction within a snapshot: `(type, target)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InteractionKey {
    #[serde(rename = "type")]
    pub kind: InteractionKind,
    pub target: String,
}

impl fmt::Display for InteractionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.target)
    }
}

impl Interaction {
    pub fn key(&self) -> InteractionKey {
        InteractionKey {
            kind: self.kind.clone(),
            target: self.target.clone(),
        }
    }
}

/// Which side implements a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionSource {
    Client,
    Backend,
}

/// A function the model may call. Carried through the server unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<FunctionSource>,
}

/// What the player currently sees and their status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameContext {
    #[serde(default)]
    pub objects_in_view: Vec<WorldObject>,
    #[serde(default)]
    pub ui_elements: Vec<UiElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_status: Option<Map<String, Value>>,
}

/// One full turn of context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub message_log: Vec<MessageTurn>,
    #[serde(default)]
    pub game_context: GameContext,
    #[serde(default)]
    pub active_interactions: Vec<Interaction>,
    #[serde(default)]
    pub available_functions: Vec<FunctionSpec>,
}

impl Snapshot {
    /// Latest turn for a role, if any.
    pub fn latest_turn(&self, role: Role) -> Option<&MessageTurn> {
        self.message_log.iter().rev().find(|t| t.role == role)
    }

    /// Keep only the last turn of each role. Retained turns keep their relative order.
    pub fn normalize_message_log(&mut self) {
        let mut seen = HashSet::new();
        let mut kept: Vec<MessageTurn> = self
            .message_log
            .drain(..)
            .rev()
            .filter(|t| seen.insert(t.role))
            .collect();
        kept.reverse();
        self.message_log = kept;
    }

    /// Replace the retained turn for `turn.role` in place, or append it.
    pub fn set_turn(&mut self, turn: MessageTurn) {
        match self.message_log.iter_mut().find(|t| t.role == turn.role) {
            Some(existing) => *existing = turn,
            None => self.message_log.push(turn),
        }
    }

    pub fn object(&self, id: &str) -> Option<&WorldObject> {
        self.game_context.objects_in_view.iter().find(|o| o.id == id)
    }

    pub fn ui_element(&self, id: &str) -> Option<&UiElement> {
        self.game_context.ui_elements.iter().find(|e| e.id == id)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionSpec> {
        self.available_functions.iter().find(|f| f.name == name)
    }

    /// Ids an interaction may target: every object and UI element id.
    pub fn target_ids(&self) -> HashSet<&str> {
        self.game_context
            .objects_in_view
            .iter()
            .map(|o| o.id.as_str())
            .chain(self.game_context.ui_elements.iter().map(|e| e.id.as_str()))
            .collect()
    }
}

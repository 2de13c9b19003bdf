use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flag name to boolean value. Ordered so serialized maps are stable.
pub type FlagMap = BTreeMap<String, bool>;

/// Server-side baseline values, as returned by `GET /api/flags`.
pub type DefaultMap = FlagMap;

/// Session-local values layered on top of the defaults.
pub type OverrideMap = FlagMap;

/// Defaults overlaid by overrides. Derived, never stored.
pub type EffectiveFlagMap = FlagMap;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid change action")]
pub struct ParseChangeActionError(pub String);

/// The kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Updated,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Created => "created",
            ChangeAction::Updated => "updated",
        }
    }
}

impl FromStr for ChangeAction {
    type Err = ParseChangeActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(ChangeAction::Created),
            "updated" => Ok(ChangeAction::Updated),
            invalid => Err(ParseChangeActionError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who made a change, e.g. `{"id": "admin-menu@hoopshop.app", "type": "email"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }
}

/// Body of `PATCH /api/flags/defaults/:flag_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultValueUpdate {
    pub value: bool,
}

/// Body of `POST /api/notify-flag-change`.
///
/// Every field is optional on the wire so the server can answer a missing
/// field with a 400 instead of a generic deserialization failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideNotification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
}

impl OverrideNotification {
    pub fn new(flag_name: &str, action: ChangeAction, actor: &Actor) -> Self {
        Self {
            flag_name: Some(flag_name.to_owned()),
            action: Some(action.to_string()),
            user_id: Some(actor.id.clone()),
            user_type: Some(actor.kind.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Why a bulk update entry was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InvalidValue,
    UnknownFlag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFlag {
    pub name: String,
    pub reason: SkipReason,
}

/// Response of `POST /api/flags/defaults`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSummary {
    pub message: String,
    #[serde(default)]
    pub updated: Vec<String>,
    #[serde(default)]
    pub unchanged: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<SkippedFlag>,
}

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Number;
use uuid::Uuid;

use crate::identity::UserId;

/// Task identifier as the persistence target hands it out.
///
/// Servers may assign any JSON number or a string; the JSON shape is kept
/// exactly so the id can be echoed back in paths and reorder payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskId {
    Number(Number),
    Text(String),
}

impl TaskId {
    pub fn random() -> Self {
        Self::Text(Uuid::new_v4().to_string())
    }

    pub fn number(n: i64) -> Self {
        Self::Number(Number::from(n))
    }

    /// Reads CLI text as an id: JSON number syntax gives a numeric id.
    pub fn parse_ref(reference: &str) -> Self {
        match serde_json::from_str::<Number>(reference) {
            Ok(n) => Self::Number(n),
            Err(_) => Self::Text(reference.to_string()),
        }
    }

    pub fn matches_ref(&self, reference: &str) -> bool {
        match self {
            Self::Number(n) => {
                serde_json::from_str::<Number>(reference).is_ok_and(|r| r == *n)
            }
            Self::Text(s) => s == reference,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,

    pub title: String,

    #[serde(default)]
    pub done: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Task {
    /// A fresh, not-yet-done task with a client-generated id.
    pub fn new_local(title: String) -> Self {
        Self {
            id: TaskId::random(),
            title,
            done: false,
            user_id: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Trims a user-entered title; blank input yields `None`.
pub fn normalize_title(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

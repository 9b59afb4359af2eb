use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::datastore::DataStore;

pub const USER_ID_KEY: &str = "studytracker-user";

/// Per-installation random token that scopes remote tasks to their owner.
///
/// Not a credential: anyone holding the token sees the same tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reuses the token cached in `store`, minting and caching one on first use.
    #[tracing::instrument(skip(store))]
    pub fn load_or_create(store: &DataStore) -> anyhow::Result<Self> {
        if let Some(existing) = store.get_item(USER_ID_KEY)?
            && !existing.trim().is_empty()
        {
            debug!("reusing cached user id");
            return Ok(Self(existing.trim().to_string()));
        }

        let minted = Self(Uuid::new_v4().to_string());
        store.set_item(USER_ID_KEY, minted.as_str())?;
        info!(user_id = %minted, "generated new user id");
        Ok(minted)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//! Role-bearing profile records and the resolver seam.
//!
//! Profiles live in an external record store, one row per account, keyed by
//! the identity provider's user id. The store is reached through the
//! [`ProfileStore`] trait so the in-memory implementation can stand in for
//! the hosted REST store in development and tests. A missing row is a normal
//! outcome (accounts exist before their profile row is provisioned) and maps
//! to `Ok(None)`; only transport and server faults are errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::roles::{self, Role};

/// Read-only projection of the identity provider's account record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "roles::deserialize_lenient")]
    pub user_types: Vec<Role>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Profile {
    /// Bare profile with no roles; fields are filled in by callers.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Profile {
            id: id.into(),
            full_name: None,
            email: None,
            phone: None,
            user_types: Vec::new(),
            address: None,
            avatar_url: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_roles<S: Into<String>>(id: S, user_types: &[Role]) -> Self {
        let mut p = Profile::new(id);
        p.user_types = user_types.to_vec();
        p
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileStoreError {
    #[error("profile store unavailable: {0}")]
    Unavailable(String),
    #[error("profile store rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Point lookup by user id. A missing record is `Ok(None)`, not an error.
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, ProfileStoreError>;
}

/// In-memory store used in local mode and as the test fixture.
#[derive(Default)]
pub struct MemoryProfileStore {
    records: RwLock<HashMap<String, Profile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, profile: Profile) {
        self.records.write().insert(profile.id.clone(), profile);
    }

    pub fn remove(&self, user_id: &str) {
        self.records.write().remove(user_id);
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, ProfileStoreError> {
        Ok(self.records.read().get(user_id).cloned())
    }
}

/// Profile lookup against the hosted record store's REST endpoint.
///
/// The endpoint follows the `?id=eq.{uid}` point-filter convention and
/// returns a JSON array with zero or one rows.
pub struct RestProfileStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestProfileStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ProfileStoreError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProfileStoreError::Unavailable(e.to_string()))?;
        Ok(RestProfileStore {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl ProfileStore for RestProfileStore {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, ProfileStoreError> {
        let url = format!(
            "{}/rest/v1/profiles?id=eq.{}&select=*",
            self.base_url,
            urlencoding::encode(user_id)
        );
        let resp = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProfileStoreError::Unavailable(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProfileStoreError::Rejected(format!("profiles lookup returned {}", status)));
        }
        let rows: Vec<Profile> = resp
            .json()
            .await
            .map_err(|e| ProfileStoreError::Rejected(format!("bad profiles payload: {}", e)))?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_miss_is_none() {
        let store = MemoryProfileStore::new();
        let got = store.fetch_profile("missing").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn memory_store_upsert_then_fetch() {
        let store = MemoryProfileStore::new();
        store.upsert(Profile::with_roles("u1", &[Role::Donor]));
        let got = store.fetch_profile("u1").await.unwrap().unwrap();
        assert_eq!(got.user_types, vec![Role::Donor]);

        store.upsert(Profile::with_roles("u1", &[Role::Donor, Role::MonasteryAdmin]));
        let got = store.fetch_profile("u1").await.unwrap().unwrap();
        assert_eq!(got.user_types, vec![Role::Donor, Role::MonasteryAdmin]);
    }

    #[test]
    fn profile_row_tolerates_unknown_role_tags() {
        let row = serde_json::json!({
            "id": "u9",
            "full_name": "Mae Khao",
            "user_types": ["donor", "legacy_volunteer"],
            "created_at": "2025-11-02T08:30:00Z"
        });
        let profile: Profile = serde_json::from_value(row).unwrap();
        assert_eq!(profile.user_types, vec![Role::Donor]);
        assert!(profile.phone.is_none());
    }

    #[test]
    fn profile_row_missing_roles_is_empty_set() {
        let row = serde_json::json!({ "id": "u10" });
        let profile: Profile = serde_json::from_value(row).unwrap();
        assert!(profile.user_types.is_empty());
    }
}

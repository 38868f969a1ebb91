//! Supabase REST API client using service_role key

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::game::Match;

use super::{CommitOutcome, MatchStore, StoreError};

/// Supabase client for server-side database operations
/// Uses service_role key which bypasses RLS - handle with care!
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseClient {
    pub fn new(base_url: &str, service_role_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key: service_role_key.to_string(),
        }
    }

    /// Get the REST API URL for a table
    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Make an authenticated GET request expecting a single row
    pub async fn get_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> Result<Option<T>, StoreError> {
        let url = format!("{}?{}", self.rest_url(table), query);

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Accept", "application/vnd.pgrst.object+json")
            .send()
            .await
            .map_err(StoreError::Request)?;

        if response.status() == reqwest::StatusCode::NOT_ACCEPTABLE {
            // No rows found
            return Ok(None);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| StoreError::Parse(e.to_string()))
    }

    /// Make an authenticated POST request (insert, no representation)
    pub async fn insert<T: Serialize>(&self, table: &str, data: &T) -> Result<(), StoreError> {
        let url = self.rest_url(table);

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(data)
            .send()
            .await
            .map_err(StoreError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    /// Make an authenticated PATCH request (update) returning the affected
    /// rows, so callers can tell whether the filter matched anything
    pub async fn update_returning<T: Serialize, R: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
        data: &T,
    ) -> Result<Vec<R>, StoreError> {
        let url = format!("{}?{}", self.rest_url(table), query);

        let response = self
            .client
            .patch(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(data)
            .send()
            .await
            .map_err(StoreError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))
    }
}

/// Row shape of the `matches` table: the aggregate is stored whole as
/// jsonb, with the version denormalized for the conditional update filter
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MatchRow {
    id: Uuid,
    version: i64,
    snapshot: Match,
    updated_at: DateTime<Utc>,
}

/// Patch payload for a conditional commit
#[derive(Debug, Clone, Serialize)]
struct MatchRowPatch<'a> {
    version: i64,
    snapshot: &'a Match,
    updated_at: DateTime<Utc>,
}

/// Match store backed by a Supabase/PostgREST table
#[derive(Clone)]
pub struct SupabaseMatchStore {
    client: SupabaseClient,
    table: String,
}

impl SupabaseMatchStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self {
            client,
            table: "matches".to_string(),
        }
    }
}

#[async_trait]
impl MatchStore for SupabaseMatchStore {
    async fn load(&self, match_id: Uuid) -> Result<Option<Match>, StoreError> {
        let row: Option<MatchRow> = self
            .client
            .get_one(&self.table, &format!("id=eq.{}&select=*", match_id))
            .await?;

        match row {
            Some(row) => {
                if row.version != row.snapshot.version as i64 {
                    return Err(StoreError::Parse(format!(
                        "row version {} disagrees with snapshot version {}",
                        row.version, row.snapshot.version
                    )));
                }
                Ok(Some(row.snapshot))
            }
            None => Ok(None),
        }
    }

    async fn commit_if_version(
        &self,
        match_id: Uuid,
        expected: u64,
        next: &Match,
    ) -> Result<CommitOutcome, StoreError> {
        if expected == 0 {
            let row = MatchRow {
                id: match_id,
                version: next.version as i64,
                snapshot: next.clone(),
                updated_at: Utc::now(),
            };
            return match self.client.insert(&self.table, &row).await {
                Ok(()) => Ok(CommitOutcome::Committed),
                // unique violation: someone inserted the row first
                Err(StoreError::Api { status: 409, .. }) => Ok(CommitOutcome::Conflict),
                Err(e) => Err(e),
            };
        }

        let patch = MatchRowPatch {
            version: next.version as i64,
            snapshot: next,
            updated_at: Utc::now(),
        };
        let updated: Vec<serde_json::Value> = self
            .client
            .update_returning(
                &self.table,
                &format!("id=eq.{}&version=eq.{}", match_id, expected),
                &patch,
            )
            .await?;

        if updated.is_empty() {
            // the filter matched nothing: the stored version moved
            Ok(CommitOutcome::Conflict)
        } else {
            Ok(CommitOutcome::Committed)
        }
    }
}

//! Persistence over the hosted backend's REST interface (PostgREST).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::budchat::BackendConfig;
use crate::budchat::capabilities::{MessageStore, NewMessage, StoreError};
use crate::budchat::error::Result;
use crate::budchat::messages::MessageRow;
use crate::budchat::profiles::Profile;
use crate::types::{MessageId, UserId};

const MESSAGE_COLUMNS: &str =
    "id,content,created_at,updated_at,user_id,parent_message_id,profiles(username,avatar_url)";
const PROFILE_COLUMNS: &str = "id,username,avatar_url,status,personal_message";

#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    rest_url: String,
    anon_key: String,
    bearer: String,
}

impl std::fmt::Debug for RestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestStore")
            .field("rest_url", &self.rest_url)
            .field("anon_key", &"<REDACTED>")
            .finish()
    }
}

#[derive(Serialize)]
struct ContentUpdate<'a> {
    content: &'a str,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct PersonalMessageUpdate<'a> {
    personal_message: &'a str,
}

#[derive(Serialize)]
struct AvatarUpdate<'a> {
    avatar_url: &'a str,
}

impl RestStore {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        config.validate()?;
        let base = config.base_url()?;
        Ok(Self {
            client: reqwest::Client::new(),
            rest_url: format!("{}/rest/v1", base.as_str().trim_end_matches('/')),
            anon_key: config.anon_key.clone(),
            bearer: config.bearer().to_string(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}/{}", self.rest_url, name)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.bearer)
    }

    async fn send(&self, request: RequestBuilder) -> std::result::Result<Response, StoreError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::warn!(
            target: "budchat::adapters::rest::send",
            "Request rejected with status {}: {}",
            status,
            body
        );
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        Err(StoreError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> std::result::Result<T, StoreError> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn write(&self, request: RequestBuilder) -> std::result::Result<(), StoreError> {
        self.send(request.header("Prefer", "return=minimal")).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for RestStore {
    async fn fetch_message_snapshot(&self) -> std::result::Result<Vec<MessageRow>, StoreError> {
        tracing::debug!(
            target: "budchat::adapters::rest::fetch_message_snapshot",
            "Fetching message snapshot"
        );
        self.fetch(
            self.client
                .get(self.table("messages"))
                .query(&[("select", MESSAGE_COLUMNS), ("order", "created_at.asc")]),
        )
        .await
    }

    async fn fetch_profile(&self, id: &UserId) -> std::result::Result<Profile, StoreError> {
        let filter = format!("eq.{}", id);
        let rows: Vec<Profile> = self
            .fetch(
                self.client
                    .get(self.table("profiles"))
                    .query(&[("select", PROFILE_COLUMNS), ("id", filter.as_str())]),
            )
            .await?;
        rows.into_iter().next().ok_or(StoreError::NotFound)
    }

    async fn fetch_roster(&self) -> std::result::Result<Vec<Profile>, StoreError> {
        self.fetch(
            self.client
                .get(self.table("profiles"))
                .query(&[("select", PROFILE_COLUMNS), ("order", "username.asc")]),
        )
        .await
    }

    async fn submit_message(&self, message: NewMessage) -> std::result::Result<(), StoreError> {
        self.write(self.client.post(self.table("messages")).json(&message))
            .await
    }

    async fn update_message(
        &self,
        id: &MessageId,
        content: &str,
        updated_at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError> {
        let filter = format!("eq.{}", id);
        self.write(
            self.client
                .patch(self.table("messages"))
                .query(&[("id", filter.as_str())])
                .json(&ContentUpdate {
                    content,
                    updated_at,
                }),
        )
        .await
    }

    async fn delete_message(&self, id: &MessageId) -> std::result::Result<(), StoreError> {
        let filter = format!("eq.{}", id);
        self.write(
            self.client
                .delete(self.table("messages"))
                .query(&[("id", filter.as_str())]),
        )
        .await
    }

    async fn update_personal_message(
        &self,
        id: &UserId,
        message: &str,
    ) -> std::result::Result<(), StoreError> {
        let filter = format!("eq.{}", id);
        self.write(
            self.client
                .patch(self.table("profiles"))
                .query(&[("id", filter.as_str())])
                .json(&PersonalMessageUpdate {
                    personal_message: message,
                }),
        )
        .await
    }

    async fn update_avatar(&self, id: &UserId, avatar_url: &str) -> std::result::Result<(), StoreError> {
        let filter = format!("eq.{}", id);
        self.write(
            self.client
                .patch(self.table("profiles"))
                .query(&[("id", filter.as_str())])
                .json(&AvatarUpdate { avatar_url }),
        )
        .await
    }
}

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::debug;

use chatvault_types::api::{
    AuthIdentity, ChannelDto, ChannelListResponse, HistoryResponse, MessageDto, MessagePage, format_ts,
    next_cursor,
};

use crate::content::ContentSource;
use crate::error::ClientError;
use crate::retry::RetryClient;
use crate::transport::{StreamResponse, Transport};

const CHANNEL_PAGE_SIZE: u32 = 200;

/// Operations the backup consumes from the remote conversation API.
pub trait ConversationApi: Send + Sync {
    /// Verify the credential and report who it belongs to.
    fn authenticate(&self) -> impl Future<Output = Result<AuthIdentity, ClientError>> + Send;

    /// Every channel visible to the credential, across all pages.
    fn list_channels(&self) -> impl Future<Output = Result<Vec<ChannelDto>, ClientError>> + Send;

    /// One page of history, newest first. `oldest` excludes everything at or
    /// before the given instant.
    fn fetch_message_page(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        oldest: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<MessagePage, ClientError>> + Send;

    /// The whole thread: the root first, then every reply in order.
    fn fetch_thread_replies(
        &self,
        channel_id: &str,
        thread_id: &str,
    ) -> impl Future<Output = Result<Vec<MessageDto>, ClientError>> + Send;
}

pub struct SlackApi<T> {
    client: RetryClient<T>,
    base_url: String,
    page_size: u32,
}

impl<T: Transport> SlackApi<T> {
    pub fn new(client: RetryClient<T>, base_url: impl Into<String>, page_size: u32) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size: page_size.clamp(1, 1000),
        }
    }

    pub fn client(&self) -> &RetryClient<T> {
        &self.client
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, query: &[(&str, String)]) -> Result<R, ClientError> {
        let body = self.client.call(method, &self.url(method), query).await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Decode(format!("{}: {}", method, e)))
    }
}

impl<T: Transport> ConversationApi for SlackApi<T> {
    async fn authenticate(&self) -> Result<AuthIdentity, ClientError> {
        self.call("auth.test", &[]).await
    }

    async fn list_channels(&self) -> Result<Vec<ChannelDto>, ClientError> {
        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![
                ("types", "public_channel,private_channel".to_string()),
                ("exclude_archived", "false".to_string()),
                ("limit", CHANNEL_PAGE_SIZE.to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }

            let page: ChannelListResponse = self.call("conversations.list", &query).await?;
            channels.extend(page.channels);

            cursor = next_cursor(&page.response_metadata);
            if cursor.is_none() {
                break;
            }
        }

        debug!("Listed {} channels", channels.len());
        Ok(channels)
    }

    async fn fetch_message_page(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        oldest: Option<DateTime<Utc>>,
    ) -> Result<MessagePage, ClientError> {
        let mut query = vec![
            ("channel", channel_id.to_string()),
            ("limit", self.page_size.to_string()),
        ];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }
        if let Some(at) = oldest {
            query.push(("oldest", format_ts(at)));
        }

        let resp: HistoryResponse = self.call("conversations.history", &query).await?;
        let next = if resp.has_more {
            next_cursor(&resp.response_metadata)
        } else {
            None
        };

        Ok(MessagePage {
            messages: resp.messages,
            next_cursor: next,
        })
    }

    async fn fetch_thread_replies(&self, channel_id: &str, thread_id: &str) -> Result<Vec<MessageDto>, ClientError> {
        let mut messages: Vec<MessageDto> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![
                ("channel", channel_id.to_string()),
                ("ts", thread_id.to_string()),
                ("limit", self.page_size.to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }

            let resp: HistoryResponse = self.call("conversations.replies", &query).await?;
            // Every page repeats the root; keep only the first copy.
            let first_page = messages.is_empty();
            messages.extend(
                resp.messages
                    .into_iter()
                    .filter(|m| first_page || m.ts != thread_id),
            );

            cursor = if resp.has_more {
                next_cursor(&resp.response_metadata)
            } else {
                None
            };
            if cursor.is_none() {
                break;
            }
        }

        Ok(messages)
    }
}

impl<T: Transport> ContentSource for SlackApi<T> {
    async fn admit(&self) -> Result<(), ClientError> {
        self.client.admit().await
    }

    async fn open(&self, url: &str) -> Result<StreamResponse, ClientError> {
        self.client.open(url).await
    }
}

//! GraphQL board client over HTTP.
//!
//! Requests are blocking `ureq` calls moved onto tokio's blocking pool.
//! Single creates and updates reuse the batcher's mutation rendering, so a
//! direct call is just a batch of one.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use boardsync_core::{BoardRef, FieldMap, GroupRef, RemoteId, RemoteItem};
use boardsync_sync::batcher::alias_for;
use boardsync_sync::{BatchTransport, CombinedMutation, GroupInfo, Mutation, RemoteClient, RemoteError};

const PAGE_SIZE: usize = 100;

const ITEM_FIELDS: &str = "id name updated_at group { id } column_values { id text }";

/// HTTP client for one API endpoint.
#[derive(Clone)]
pub struct HttpBoard {
    agent: ureq::Agent,
    url: String,
    token: Option<String>,
    token_env: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiItem {
    id: String,
    name: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    group: Option<ApiGroup>,
    #[serde(default)]
    column_values: Vec<ApiColumn>,
}

#[derive(Debug, Deserialize)]
struct ApiGroup {
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct ApiColumn {
    id: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemsPage {
    cursor: Option<String>,
    items: Vec<ApiItem>,
}

impl From<ApiItem> for RemoteItem {
    fn from(item: ApiItem) -> Self {
        let fields = item
            .column_values
            .into_iter()
            .map(|c| (c.id, c.text.map(Value::from).unwrap_or(Value::Null)))
            .collect();
        RemoteItem {
            id: RemoteId(item.id),
            name: item.name,
            updated_at: item.updated_at,
            group: item.group.map(|g| GroupRef(g.id)),
            fields,
        }
    }
}

impl HttpBoard {
    /// `token` is read from `token_env` by the caller; `None` makes every
    /// request fail with a message naming the variable.
    pub fn new(url: impl Into<String>, token: Option<String>, token_env: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            agent,
            url: url.into(),
            token,
            token_env: token_env.into(),
        }
    }

    async fn request(&self, query: String, variables: Value) -> Result<GraphQlResponse, RemoteError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.request_blocking(&query, &variables))
            .await
            .map_err(|e| RemoteError::Transient(format!("request task failed: {e}")))?
    }

    fn request_blocking(&self, query: &str, variables: &Value) -> Result<GraphQlResponse, RemoteError> {
        let token = self.token.as_deref().ok_or_else(|| {
            RemoteError::Rejected(format!("no API token: set ${}", self.token_env))
        })?;
        tracing::debug!(url = %self.url, "graphql request");
        let response = self
            .agent
            .post(&self.url)
            .set("Authorization", token)
            .send_json(json!({ "query": query, "variables": variables }));
        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(429, response)) => {
                let retry_after = response
                    .header("Retry-After")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(RemoteError::RateLimited { retry_after });
            }
            Err(ureq::Error::Status(code, _)) if code >= 500 => {
                return Err(RemoteError::Transient(format!("HTTP {code}")));
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(RemoteError::Rejected(format!("HTTP {code}: {body}")));
            }
            Err(ureq::Error::Transport(err)) => return Err(RemoteError::Transient(err.to_string())),
        };
        response
            .into_json::<GraphQlResponse>()
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    /// Run a query whose every error is fatal and return its `data`.
    async fn query(&self, query: String, variables: Value) -> Result<Value, RemoteError> {
        let response = self.request(query, variables).await?;
        if let Some(err) = classify_errors(&response.errors) {
            return Err(err);
        }
        response
            .data
            .ok_or_else(|| RemoteError::Decode("response has no data".into()))
    }

    async fn mutate_one(&self, mutation: Mutation) -> Result<RemoteItem, RemoteError> {
        let combined = CombinedMutation::build(vec![mutation]);
        let mut data = self.send(&combined).await?;
        match data.remove(&alias_for(0)) {
            Some(Value::Null) | None => Err(RemoteError::Rejected("mutation returned no item".into())),
            Some(value) => decode::<ApiItem>(value).map(RemoteItem::from),
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, RemoteError> {
    serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Map GraphQL error messages onto [`RemoteError`] kinds.
fn classify_errors(errors: &[GraphQlError]) -> Option<RemoteError> {
    if errors.is_empty() {
        return None;
    }
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let lower = message.to_ascii_lowercase();
    Some(if lower.contains("complexity") || lower.contains("rate limit") {
        RemoteError::RateLimited { retry_after: None }
    } else if lower.contains("not found") || lower.contains("does not exist") {
        RemoteError::NotFound(message)
    } else {
        RemoteError::Rejected(message)
    })
}

#[async_trait]
impl RemoteClient for HttpBoard {
    async fn fetch_items(
        &self,
        board: &BoardRef,
        group: Option<&GroupRef>,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let first = format!(
            "query($board: [ID!]) {{ boards(ids: $board) {{ items_page(limit: {PAGE_SIZE}) {{ cursor items {{ {ITEM_FIELDS} }} }} }} }}"
        );
        let data = self.query(first, json!({ "board": [board.0] })).await?;
        let page = data
            .pointer("/boards/0/items_page")
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("board {board}")))?;
        let mut page: ItemsPage = decode(page)?;
        let mut items: Vec<RemoteItem> = page.items.drain(..).map(RemoteItem::from).collect();

        while let Some(cursor) = page.cursor.take() {
            let next = format!(
                "query($cursor: String!) {{ next_items_page(limit: {PAGE_SIZE}, cursor: $cursor) {{ cursor items {{ {ITEM_FIELDS} }} }} }}"
            );
            let data = self.query(next, json!({ "cursor": cursor })).await?;
            let value = data
                .get("next_items_page")
                .cloned()
                .ok_or_else(|| RemoteError::Decode("missing next_items_page".into()))?;
            page = decode(value)?;
            items.extend(page.items.drain(..).map(RemoteItem::from));
        }

        if let Some(group) = group {
            items.retain(|item| item.group.as_ref() == Some(group));
        }
        tracing::debug!(board = %board, count = items.len(), "fetched items");
        Ok(items)
    }

    async fn get_item(&self, id: &RemoteId) -> Result<Option<RemoteItem>, RemoteError> {
        let query = format!("query($id: [ID!]) {{ items(ids: $id) {{ {ITEM_FIELDS} }} }}");
        let data = self.query(query, json!({ "id": [id.0] })).await?;
        match data.pointer("/items/0") {
            Some(Value::Null) | None => Ok(None),
            Some(item) => decode::<ApiItem>(item.clone()).map(|i| Some(i.into())),
        }
    }

    async fn create_item(
        &self,
        board: &BoardRef,
        group: &GroupRef,
        name: &str,
        fields: &FieldMap,
    ) -> Result<RemoteItem, RemoteError> {
        self.mutate_one(Mutation::CreateItem {
            board: board.clone(),
            group: group.clone(),
            name: name.to_owned(),
            fields: fields.clone(),
        })
        .await
    }

    async fn update_item(
        &self,
        board: &BoardRef,
        id: &RemoteId,
        fields: &FieldMap,
    ) -> Result<RemoteItem, RemoteError> {
        self.mutate_one(Mutation::UpdateItem {
            board: board.clone(),
            id: id.clone(),
            fields: fields.clone(),
        })
        .await
    }

    async fn delete_item(&self, id: &RemoteId) -> Result<bool, RemoteError> {
        let query = "mutation($id: ID!) { delete_item(item_id: $id) { id } }".to_owned();
        match self.query(query, json!({ "id": id.0 })).await {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_groups(&self, board: &BoardRef) -> Result<Vec<GroupInfo>, RemoteError> {
        let query = "query($board: [ID!]) { boards(ids: $board) { groups { id title } } }".to_owned();
        let data = self.query(query, json!({ "board": [board.0] })).await?;
        let groups = data
            .pointer("/boards/0/groups")
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("board {board}")))?;
        Ok(decode::<Vec<ApiGroup>>(groups)?
            .into_iter()
            .map(|g| GroupInfo {
                id: GroupRef(g.id),
                title: g.title,
            })
            .collect())
    }

    async fn post_note(&self, id: &RemoteId, body: &str) -> Result<String, RemoteError> {
        let query =
            "mutation($item: ID!, $body: String!) { create_update(item_id: $item, body: $body) { id } }"
                .to_owned();
        let data = self.query(query, json!({ "item": id.0, "body": body })).await?;
        data.pointer("/create_update/id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RemoteError::Decode("create_update returned no id".into()))
    }
}

#[async_trait]
impl BatchTransport for HttpBoard {
    /// Partial failures come back as null aliases; only a response without
    /// any data fails the whole batch.
    async fn send(&self, batch: &CombinedMutation) -> Result<Map<String, Value>, RemoteError> {
        let response = self
            .request(batch.document.clone(), Value::Object(batch.variables.clone()))
            .await?;
        match response.data {
            Some(Value::Object(data)) => {
                if !response.errors.is_empty() {
                    tracing::warn!(
                        errors = response.errors.len(),
                        "batch completed with partial errors"
                    );
                }
                Ok(data)
            }
            _ => Err(classify_errors(&response.errors)
                .unwrap_or_else(|| RemoteError::Decode("batch response has no data".into()))),
        }
    }
}

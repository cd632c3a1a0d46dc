//! Mutation batcher: coalesces independent remote writes into one round trip.
//!
//! Each queued [`Mutation`] gets a oneshot channel; the caller holds the
//! receiving end as a [`MutationHandle`] and awaits it. When the queue
//! reaches `max_batch`, or on [`MutationBatcher::flush`], the queued
//! operations are combined:
//!
//! ```text
//! mutation Batch($board_0: ID!, $group_0: String, …, $board_1: ID!, $item_1: ID!, …) {
//!   op0: create_item(board_id: $board_0, group_id: $group_0, …) { id name updated_at }
//!   op1: change_multiple_column_values(board_id: $board_1, item_id: $item_1, …) { id name updated_at }
//! }
//! ```
//!
//! Operation `i` is aliased `op{i}` and every variable it declares is
//! suffixed `_{i}`, so identical parameter names never collide. The response
//! map is split back by alias. If the combined call itself fails, every
//! handle in that batch receives the same error.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, Mutex};

use boardsync_core::{BoardRef, FieldMap, GroupRef, RemoteId, RemoteItem};

use crate::error::RemoteError;
use crate::retry::{with_retry, RetryPolicy};

/// Default queue length that triggers an automatic flush.
pub const DEFAULT_MAX_BATCH: usize = 10;

const ITEM_SELECTION: &str = "{ id name updated_at }";

/// A single remote write.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateItem {
        board: BoardRef,
        group: GroupRef,
        name: String,
        fields: FieldMap,
    },
    UpdateItem {
        board: BoardRef,
        id: RemoteId,
        fields: FieldMap,
    },
}

/// A declared query variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub ty: &'static str,
    pub value: Value,
}

impl Variable {
    fn new(name: &str, ty: &'static str, value: impl Into<Value>) -> Self {
        Self {
            name: name.to_owned(),
            ty,
            value: value.into(),
        }
    }
}

impl Mutation {
    /// Field selection and variables, before namespacing.
    pub fn render(&self) -> (String, Vec<Variable>) {
        match self {
            Mutation::CreateItem {
                board,
                group,
                name,
                fields,
            } => (
                format!(
                    "create_item(board_id: $board, group_id: $group, item_name: $name, \
                     column_values: $columns) {ITEM_SELECTION}"
                ),
                vec![
                    Variable::new("board", "ID!", board.0.as_str()),
                    Variable::new("group", "String", group.0.as_str()),
                    Variable::new("name", "String!", name.as_str()),
                    Variable::new("columns", "JSON", encode_columns(fields)),
                ],
            ),
            Mutation::UpdateItem { board, id, fields } => (
                format!(
                    "change_multiple_column_values(board_id: $board, item_id: $item, \
                     column_values: $columns) {ITEM_SELECTION}"
                ),
                vec![
                    Variable::new("board", "ID!", board.0.as_str()),
                    Variable::new("item", "ID!", id.0.as_str()),
                    Variable::new("columns", "JSON", encode_columns(fields)),
                ],
            ),
        }
    }
}

/// Column values travel as one JSON-encoded string.
pub fn encode_columns(fields: &FieldMap) -> String {
    Value::Object(fields.clone().into_iter().collect()).to_string()
}

/// Several mutations folded into one request.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedMutation {
    pub document: String,
    pub variables: Map<String, Value>,
    /// `(alias, mutation)` in queue order.
    pub operations: Vec<(String, Mutation)>,
}

impl CombinedMutation {
    pub fn build(mutations: Vec<Mutation>) -> Self {
        let mut declarations = Vec::new();
        let mut selections = Vec::new();
        let mut variables = Map::new();
        let mut operations = Vec::with_capacity(mutations.len());

        for (index, mutation) in mutations.into_iter().enumerate() {
            let alias = alias_for(index);
            let (field, vars) = mutation.render();
            selections.push(format!("{alias}: {}", namespace_variables(&field, index)));
            for var in vars {
                let name = format!("{}_{index}", var.name);
                declarations.push(format!("${name}: {}", var.ty));
                variables.insert(name, var.value);
            }
            operations.push((alias, mutation));
        }

        let document = format!(
            "mutation Batch({}) {{ {} }}",
            declarations.join(", "),
            selections.join(" ")
        );
        Self {
            document,
            variables,
            operations,
        }
    }
}

pub fn alias_for(index: usize) -> String {
    format!("op{index}")
}

/// Rewrite every `$ident` in `text` to `$ident_{index}`.
fn namespace_variables(text: &str, index: usize) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if c != '$' {
            continue;
        }
        let mut ident = false;
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                out.push(next);
                chars.next();
                ident = true;
            } else {
                break;
            }
        }
        if ident {
            out.push('_');
            out.push_str(&index.to_string());
        }
    }
    out
}

/// Sends one combined request and returns the response payload keyed by
/// alias.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send(&self, batch: &CombinedMutation) -> Result<Map<String, Value>, RemoteError>;
}

type Reply = Result<RemoteItem, RemoteError>;

struct Pending {
    mutation: Mutation,
    respond_to: oneshot::Sender<Reply>,
}

/// Resolves once the batch containing its mutation has executed.
#[derive(Debug)]
pub struct MutationHandle {
    rx: oneshot::Receiver<Reply>,
}

impl Future for MutationHandle {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(RemoteError::Transient(
                    "batch was dropped before it was sent".into(),
                ))
            })
        })
    }
}

/// Queue of pending mutations flushed by size or on demand.
pub struct MutationBatcher {
    transport: Arc<dyn BatchTransport>,
    max_batch: usize,
    retry: RetryPolicy,
    queue: Mutex<Vec<Pending>>,
}

impl MutationBatcher {
    pub fn new(transport: Arc<dyn BatchTransport>, max_batch: usize) -> Self {
        Self {
            transport,
            max_batch: max_batch.max(1),
            retry: RetryPolicy::default(),
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Queue `mutation`. Sends the batch right away if the queue is full.
    pub async fn enqueue(&self, mutation: Mutation) -> MutationHandle {
        let (respond_to, rx) = oneshot::channel();
        let full = {
            let mut queue = self.queue.lock().await;
            queue.push(Pending {
                mutation,
                respond_to,
            });
            if queue.len() >= self.max_batch {
                Some(std::mem::take(&mut *queue))
            } else {
                None
            }
        };
        if let Some(batch) = full {
            self.execute(batch).await;
        }
        MutationHandle { rx }
    }

    /// Send everything queued. Returns the number of mutations sent.
    pub async fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.queue.lock().await);
        let sent = batch.len();
        self.execute(batch).await;
        sent
    }

    async fn execute(&self, batch: Vec<Pending>) {
        if batch.is_empty() {
            return;
        }
        let (mutations, senders): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|p| (p.mutation, p.respond_to))
            .unzip();
        let combined = CombinedMutation::build(mutations);
        tracing::debug!(operations = senders.len(), "sending mutation batch");

        let transport = &self.transport;
        let combined_ref = &combined;
        let result = with_retry(&self.retry, "mutation_batch", move || {
            transport.send(combined_ref)
        })
        .await;

        match result {
            Ok(mut response) => {
                for ((alias, _), sender) in combined.operations.iter().zip(senders) {
                    let reply = match response.remove(alias) {
                        Some(Value::Null) | None => Err(RemoteError::Rejected(format!(
                            "no result for {alias} in batch response"
                        ))),
                        Some(value) => serde_json::from_value::<RemoteItem>(value)
                            .map_err(|e| RemoteError::Decode(e.to_string())),
                    };
                    let _ = sender.send(reply);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, operations = senders.len(), "mutation batch failed");
                for sender in senders {
                    let _ = sender.send(Err(err.clone()));
                }
            }
        }
    }
}

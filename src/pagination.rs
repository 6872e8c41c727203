//! Cursor pagination over message history
//!
//! History is listed newest first. Moving forward (`first`/`after`) walks
//! towards older messages, moving backward (`last`/`before`) towards newer
//! ones. When both directions are supplied the forward pair wins.
//!
//! Cursors look like `cur-<base64url("message:<id>")>`.

use crate::error::ApiError;
use crate::model::{GroupId, Message, MessageId};
use crate::storage::{IdBound, MessageWindow, SortOrder, Store};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CURSOR_PREFIX: &str = "cur-";
const CURSOR_TAG: &str = "message:";

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    #[error("cursor is not recognized")]
    Foreign,

    #[error("cursor is malformed")]
    Malformed,
}

impl From<CursorError> for ApiError {
    fn from(err: CursorError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

/// Encode a message id as an opaque cursor
pub fn encode_cursor(id: MessageId) -> String {
    let raw = format!("{}{}", CURSOR_TAG, id);
    format!("{}{}", CURSOR_PREFIX, URL_SAFE_NO_PAD.encode(raw.as_bytes()))
}

/// Decode a cursor produced by [`encode_cursor`]
pub fn decode_cursor(cursor: &str) -> Result<MessageId, CursorError> {
    let body = cursor.strip_prefix(CURSOR_PREFIX).ok_or(CursorError::Foreign)?;
    let raw = URL_SAFE_NO_PAD.decode(body).map_err(|_| CursorError::Malformed)?;
    let raw = std::str::from_utf8(&raw).map_err(|_| CursorError::Malformed)?;
    let digits = raw.strip_prefix(CURSOR_TAG).ok_or(CursorError::Foreign)?;

    // Reject "+5", "05" and friends so every id has exactly one cursor
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CursorError::Malformed);
    }
    digits.parse().map_err(|_| CursorError::Malformed)
}

/// Pagination arguments as received from the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
}

impl PageArgs {
    pub fn first(n: u32) -> Self {
        Self { first: Some(n), ..Self::default() }
    }

    pub fn first_after(n: u32, cursor: impl Into<String>) -> Self {
        Self { first: Some(n), after: Some(cursor.into()), ..Self::default() }
    }

    pub fn last(n: u32) -> Self {
        Self { last: Some(n), ..Self::default() }
    }

    pub fn last_before(n: u32, cursor: impl Into<String>) -> Self {
        Self { last: Some(n), before: Some(cursor.into()), ..Self::default() }
    }

    /// Check sizes and cursors without touching the store
    pub fn validate(&self) -> Result<(), ApiError> {
        for (name, size) in [("first", self.first), ("last", self.last)] {
            if let Some(n) = size {
                if n == 0 || n as usize > MAX_PAGE_SIZE {
                    return Err(ApiError::Validation(format!(
                        "{} must be between 1 and {}",
                        name, MAX_PAGE_SIZE
                    )));
                }
            }
        }
        self.direction().map(|_| ())
    }

    /// Resolve the one direction this request will be served in
    pub fn direction(&self) -> Result<Direction, ApiError> {
        let forward = self.first.is_some() || self.after.is_some();
        let backward = self.last.is_some() || self.before.is_some();

        if backward && !forward {
            let limit = self.last.map(|n| n as usize).unwrap_or(DEFAULT_PAGE_SIZE);
            let before = self.before.as_deref().map(decode_cursor).transpose()?;
            return Ok(Direction::Backward { limit, before });
        }

        let limit = self.first.map(|n| n as usize).unwrap_or(DEFAULT_PAGE_SIZE);
        let after = self.after.as_deref().map(decode_cursor).transpose()?;
        Ok(Direction::Forward { limit, after })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards older messages, starting below `after`
    Forward { limit: usize, after: Option<MessageId> },
    /// Towards newer messages, starting above `before`
    Backward { limit: usize, before: Option<MessageId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// More (older) messages exist past the last edge
    pub has_next_page: bool,
    /// More (newer) messages exist before the first edge
    pub has_previous_page: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<T> {
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
}

impl<T> Connection<T> {
    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.edges.iter().map(|e| &e.node)
    }

    pub fn end_cursor(&self) -> Option<&str> {
        self.edges.last().map(|e| e.cursor.as_str())
    }

    pub fn start_cursor(&self) -> Option<&str> {
        self.edges.first().map(|e| e.cursor.as_str())
    }
}

/// Fetch one page of a group's history, newest first.
///
/// Rows are fetched without over-fetching; the page-info flags come from two
/// independent existence probes issued concurrently.
pub async fn page_messages(
    store: &dyn Store,
    group_id: GroupId,
    args: &PageArgs,
) -> Result<Connection<Message>, ApiError> {
    let direction = args.direction()?;

    let rows = match direction {
        Direction::Forward { limit, after } => {
            let window = MessageWindow {
                bound: after.map(IdBound::Below),
                order: SortOrder::Descending,
                limit,
            };
            store.list_messages(group_id, window).await?
        }
        Direction::Backward { limit, before } => {
            let window = MessageWindow {
                bound: before.map(IdBound::Above),
                order: SortOrder::Ascending,
                limit,
            };
            let mut rows = store.list_messages(group_id, window).await?;
            rows.reverse();
            rows
        }
    };

    // Probe bounds: past the oldest/newest row on the page, or past the
    // request cursor itself when the page came back empty.
    let (older_than, newer_than) = match (rows.last(), rows.first(), direction) {
        (Some(oldest), Some(newest), _) => (Some(oldest.id), Some(newest.id)),
        (_, _, Direction::Forward { after, .. }) => (None, after.map(|a| a.saturating_sub(1))),
        (_, _, Direction::Backward { before, .. }) => (before.map(|b| b.saturating_add(1)), None),
    };

    let has_next = async {
        match older_than {
            Some(id) => store.message_exists(group_id, IdBound::Below(id)).await,
            None => Ok(false),
        }
    };
    let has_previous = async {
        match newer_than {
            Some(id) => store.message_exists(group_id, IdBound::Above(id)).await,
            None => Ok(false),
        }
    };
    let (has_next_page, has_previous_page) = tokio::try_join!(has_next, has_previous)?;

    let edges = rows
        .into_iter()
        .map(|node| Edge {
            cursor: encode_cursor(node.id),
            node,
        })
        .collect();

    Ok(Connection {
        edges,
        page_info: PageInfo {
            has_next_page,
            has_previous_page,
        },
    })
}

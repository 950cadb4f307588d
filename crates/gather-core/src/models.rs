//! Records collected from the external platform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A platform group resolved from a submitted identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Platform-assigned identifier (the one submitted by the caller).
    pub external_id: String,
    pub name: String,
    pub member_count: Option<u64>,
    pub privacy: Option<String>,
}

/// A post belonging to a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub external_id: String,
    pub group_id: String,
    pub author: Option<String>,
    pub message: Option<String>,
    pub created_time: Option<DateTime<Utc>>,
    /// Comment count reported by the platform, used to size the comments phase.
    pub comment_count: Option<u64>,
}

/// A comment belonging to a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub external_id: String,
    pub post_id: String,
    pub author: Option<String>,
    pub message: Option<String>,
    pub created_time: Option<DateTime<Utc>>,
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
    /// Total item count when the platform reports it.
    pub total: Option<u64>,
}

impl<T> Page<T> {
    /// A final page with no further cursor.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
            total: None,
        }
    }

    pub fn with_next_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.next_cursor = Some(cursor.into());
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

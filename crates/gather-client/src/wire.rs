//! JSON shapes of the platform API.
//!
//! Listings share one envelope:
//!
//! ```json
//! {
//!     "data": [ ... ],
//!     "paging": { "next_cursor": "abc" },
//!     "total_count": 120
//! }
//! ```
//!
//! `paging` is absent on the last page and `total_count` is only sent by
//! endpoints that know it.

use chrono::{DateTime, Utc};
use gather_core::models::{Comment, Group, Page, Post};
use serde::Deserialize;

/// Listing envelope.
#[derive(Deserialize, Debug)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub paging: Option<Paging>,
    #[serde(default)]
    pub total_count: Option<u64>,
}

#[derive(Deserialize, Debug)]
pub struct Paging {
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl<T> ListResponse<T> {
    /// Converts the envelope into a [`Page`], mapping every item with `f`.
    ///
    /// An empty cursor string counts as no cursor.
    pub fn into_page<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        let mut page = Page::last(self.data.into_iter().map(f).collect());
        if let Some(cursor) = self
            .paging
            .and_then(|p| p.next_cursor)
            .filter(|c| !c.is_empty())
        {
            page = page.with_next_cursor(cursor);
        }
        if let Some(total) = self.total_count {
            page = page.with_total(total);
        }
        page
    }
}

/// Error body returned with non-2xx statuses.
#[derive(Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Deserialize, Debug)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub code: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GroupDto {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub member_count: Option<u64>,
    #[serde(default)]
    pub privacy: Option<String>,
}

impl From<GroupDto> for Group {
    fn from(dto: GroupDto) -> Self {
        Group {
            name: dto.name.unwrap_or_else(|| dto.id.clone()),
            external_id: dto.id,
            member_count: dto.member_count,
            privacy: dto.privacy,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PostDto {
    pub id: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment_count: Option<u64>,
}

impl PostDto {
    pub fn into_post(self, group_id: &str) -> Post {
        Post {
            external_id: self.id,
            group_id: group_id.to_string(),
            author: self.author,
            message: self.message,
            created_time: self.created_time,
            comment_count: self.comment_count,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct CommentDto {
    pub id: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
}

impl CommentDto {
    pub fn into_comment(self, post_id: &str) -> Comment {
        Comment {
            external_id: self.id,
            post_id: post_id.to_string(),
            author: self.author,
            message: self.message,
            created_time: self.created_time,
        }
    }
}

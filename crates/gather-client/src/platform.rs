//! HTTP client for the external platform API.
//!
//! # Endpoints
//!
//! | call                | request                                            |
//! |---------------------|----------------------------------------------------|
//! | `fetch_group`       | `GET {base}/groups/{id}`                           |
//! | `fetch_posts`       | `GET {base}/groups/{id}/posts?limit=&after=`       |
//! | `fetch_comments`    | `GET {base}/posts/{id}/comments?limit=&after=`     |
//!
//! Every request carries the access token as a bearer token. The client makes
//! exactly one attempt per call; retrying and rate limiting are layered on top
//! by `gather_core` (`RetryPolicy`, `RateLimitedClient`).
//!
//! # Examples
//!
//! ```no_run
//! use gather_client::HttpPlatformClient;
//! use gather_core::PlatformClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpPlatformClient::new("https://platform.example.com/v1", "token")?;
//! let group = client.fetch_group("123456").await?;
//! println!("{} ({:?} members)", group.name, group.member_count);
//! # Ok(())
//! # }
//! ```

use gather_core::HttpConfig;
use gather_core::error::AppError;
use gather_core::models::{Comment, Group, Page, Post};
use gather_core::traits::PlatformClient;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::wire::{CommentDto, ErrorResponse, GroupDto, ListResponse, PostDto};

/// Checks that `id` can be used as a path segment of a platform URL.
///
/// Platform ids are non-empty and made of ASCII letters, digits, `_` and `-`.
///
/// # Examples
///
/// ```
/// use gather_client::validate_id;
///
/// assert!(validate_id("123_456").is_ok());
/// assert!(validate_id("../admin").is_err());
/// ```
pub fn validate_id(id: &str) -> Result<&str, AppError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(id)
    } else {
        Err(AppError::InvalidId(id.to_string()))
    }
}

/// Maps a non-success status to the error taxonomy of the pipeline.
///
/// `what` names the resource for permanent errors, e.g. `group 42`.
fn error_for_status(status: StatusCode, message: String, what: &str, timeout_secs: u64) -> AppError {
    match status {
        StatusCode::UNAUTHORIZED => AppError::Unauthorized(message),
        StatusCode::FORBIDDEN => AppError::Forbidden(format!("{}: {}", what, message)),
        StatusCode::NOT_FOUND | StatusCode::GONE => AppError::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimitExceeded,
        StatusCode::REQUEST_TIMEOUT => AppError::Timeout(timeout_secs),
        s if s.is_server_error() => AppError::ServerError(s.as_u16()),
        s => AppError::ClientError(format!("HTTP {} for {}: {}", s.as_u16(), what, message)),
    }
}

/// HTTP implementation of [`PlatformClient`].
#[derive(Clone)]
pub struct HttpPlatformClient {
    client: Client,
    base_url: Url,
    access_token: String,
    page_size: u32,
    timeout_secs: u64,
}

impl HttpPlatformClient {
    /// Creates a client with the default [`HttpConfig`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the URL is not an absolute http(s) URL.
    /// Returns `AppError::ClientError` if the HTTP client cannot be built.
    pub fn new(base_url: &str, access_token: &str) -> Result<Self, AppError> {
        Self::with_config(base_url, access_token, HttpConfig::default())
    }

    pub fn with_config(
        base_url: &str,
        access_token: &str,
        config: HttpConfig,
    ) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("invalid platform URL {}: {}", base_url, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(AppError::ConfigError(format!(
                "platform URL must be http(s): {}",
                base_url
            )));
        }

        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            access_token: access_token.to_string(),
            page_size: config.page_size.max(1),
            timeout_secs: config.timeout.as_secs(),
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Builds `{base}/{segments...}`; segments are percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::ConfigError(format!("invalid platform URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn listing(&self, segments: &[&str], cursor: Option<&str>) -> Result<Url, AppError> {
        let mut url = self.endpoint(segments)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &self.page_size.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("after", cursor);
            }
        }
        Ok(url)
    }

    /// Sends one GET and decodes the JSON body.
    async fn get<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T, AppError> {
        debug!(%url, "GET");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Cannot connect to platform: {}", e))
                } else {
                    AppError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else {
                AppError::NetworkError(format!("Failed to read response body: {}", e))
            }
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));
            return Err(error_for_status(status, message, what, self.timeout_secs));
        }

        Ok(serde_json::from_str(&body)?)
    }
}

impl PlatformClient for HttpPlatformClient {
    async fn fetch_group(&self, group_id: &str) -> Result<Group, AppError> {
        let id = validate_id(group_id)?;
        let url = self.endpoint(&["groups", id])?;
        let dto: GroupDto = self.get(url, &format!("group {}", id)).await?;
        Ok(dto.into())
    }

    async fn fetch_posts(&self, group_id: &str, cursor: Option<&str>) -> Result<Page<Post>, AppError> {
        let id = validate_id(group_id)?;
        let url = self.listing(&["groups", id, "posts"], cursor)?;
        let resp: ListResponse<PostDto> = self.get(url, &format!("posts of group {}", id)).await?;
        Ok(resp.into_page(|p| p.into_post(id)))
    }

    async fn fetch_comments(
        &self,
        post_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<Comment>, AppError> {
        let id = validate_id(post_id)?;
        let url = self.listing(&["posts", id, "comments"], cursor)?;
        let resp: ListResponse<CommentDto> =
            self.get(url, &format!("comments of post {}", id)).await?;
        Ok(resp.into_page(|c| c.into_comment(id)))
    }
}

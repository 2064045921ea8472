//! HTTP client for the hosted backend: PostgREST rows, GoTrue auth and
//! object storage.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::backend::FeedBackend;
use crate::{
    BackendError, BlobRef, CommentId, CommentRow, NewPost, Post, PostId, Profile, Session, UserId,
};

/// Default storage bucket for uploaded images.
pub const DEFAULT_BUCKET: &str = "memes";

const POST_COLUMNS: &str = "id,created_at,title,image_url,user_id,votes";
const COMMENT_COLUMNS: &str = "id,post_id,content,created_at,user_id,profiles(username)";
const PROFILE_COLUMNS: &str = "id,username,avatar_url";

/// Post ids per `in.(...)` filter, keeping request URLs short.
const COMMENT_BATCH: usize = 100;

/// Client for the hosted backend's REST surfaces.
pub struct RestClient {
    http: Client,
    base_url: String,
    anon_key: String,
    bucket: String,
}

impl RestClient {
    /// Create a client for the project at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            bucket: DEFAULT_BUCKET.to_string(),
        })
    }

    /// Use a different storage bucket.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// Project base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Public URL of an object in the bucket.
    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }

    /// Email a one-time sign-in code.
    pub async fn send_otp(&self, email: &str) -> Result<(), BackendError> {
        let url = format!("{}/auth/v1/otp", self.base_url);
        let response = self
            .request(Method::POST, &url, None)
            .json(&json!({ "email": email, "create_user": true }))
            .send()
            .await?;

        Self::check_response(response).await?;
        debug!(email, "sign-in code sent");
        Ok(())
    }

    /// Exchange an emailed code for a session.
    pub async fn verify_otp(&self, email: &str, token: &str) -> Result<Session, BackendError> {
        let url = format!("{}/auth/v1/verify", self.base_url);
        let response = self
            .request(Method::POST, &url, None)
            .json(&json!({ "type": "email", "email": email, "token": token }))
            .send()
            .await?;

        let grant: TokenGrant = Self::handle_response(response).await.map_err(|e| match e {
            BackendError::Api { message, .. } => BackendError::Auth(message),
            other => other,
        })?;
        let session = grant.into_session();
        debug!(user_id = %session.user_id, "signed in");
        Ok(session)
    }

    /// Trade a session's refresh token for a fresh session.
    pub async fn refresh_session(&self, session: &Session) -> Result<Session, BackendError> {
        let refresh_token = session
            .refresh_token
            .as_deref()
            .ok_or_else(|| BackendError::Auth("session has no refresh token".to_string()))?;

        let url = format!("{}/auth/v1/token", self.base_url);
        let response = self
            .request(Method::POST, &url, None)
            .query(&[("grant_type", "refresh_token")])
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let grant: TokenGrant = Self::handle_response(response).await.map_err(|e| match e {
            BackendError::Api { message, .. } => BackendError::Auth(message),
            other => other,
        })?;
        let session = grant.into_session();
        debug!(user_id = %session.user_id, "session refreshed");
        Ok(session)
    }

    /// Revoke a session.
    pub async fn sign_out(&self, session: &Session) -> Result<(), BackendError> {
        let url = format!("{}/auth/v1/logout", self.base_url);
        let response = self
            .request(Method::POST, &url, Some(session))
            .send()
            .await?;

        Self::check_response(response).await?;
        debug!(user_id = %session.user_id, "signed out");
        Ok(())
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Build a request carrying the project key and the caller's token
    /// (the anon key when signed out).
    fn request(&self, method: Method, url: &str, session: Option<&Session>) -> RequestBuilder {
        let token = session
            .map(|s| s.access_token.as_str())
            .unwrap_or(&self.anon_key);
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", token))
    }

    /// Run a read, retrying transient failures.
    async fn read<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<T, BackendError> {
        // Initial attempt + 3 retries: 500ms, 1s, 2s.
        let mut attempt = 0;
        loop {
            let result = match build().send().await {
                Ok(response) => Self::handle_response(response).await,
                Err(e) => Err(e.into()),
            };

            match result {
                Err(ref e) if e.is_transient() && attempt < 3 => {
                    let backoff_ms = 500 * (1 << attempt);
                    debug!(
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        operation,
                        "transient error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Handle an HTTP response and parse its JSON body.
    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
        let response = Self::error_for_status(response).await?;
        Ok(response.json().await?)
    }

    /// Handle an HTTP response whose body is ignored.
    async fn check_response(response: Response) -> Result<(), BackendError> {
        Self::error_for_status(response).await.map(|_| ())
    }

    async fn error_for_status(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.map_err(|e| {
            BackendError::InvalidResponse(format!(
                "request failed ({}): failed to read response: {}",
                status, e
            ))
        })?;
        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .ok()
            .and_then(ApiErrorBody::into_message)
            .unwrap_or(text);

        if status == StatusCode::UNAUTHORIZED {
            return Err(BackendError::Auth(message));
        }
        Err(BackendError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl FeedBackend for RestClient {
    async fn list_posts(&self) -> Result<Vec<Post>, BackendError> {
        let url = self.table_url("posts");
        self.read("list_posts", || {
            self.request(Method::GET, &url, None)
                .query(&[("select", POST_COLUMNS), ("order", "created_at.desc")])
        })
        .await
    }

    async fn list_comments(&self, post_ids: &[PostId]) -> Result<Vec<CommentRow>, BackendError> {
        let url = self.table_url("comments");
        let mut rows = Vec::new();

        for chunk in post_ids.chunks(COMMENT_BATCH) {
            let ids = chunk
                .iter()
                .map(PostId::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let filter = format!("in.({})", ids);
            let batch: Vec<CommentRow> = self
                .read("list_comments", || {
                    self.request(Method::GET, &url, None).query(&[
                        ("select", COMMENT_COLUMNS),
                        ("post_id", filter.as_str()),
                        ("order", "created_at.asc"),
                    ])
                })
                .await?;
            rows.extend(batch);
        }

        if post_ids.len() > COMMENT_BATCH {
            // Batches are each ordered; restore the global order.
            rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        }
        Ok(rows)
    }

    async fn get_comment(&self, id: CommentId) -> Result<Option<CommentRow>, BackendError> {
        let url = self.table_url("comments");
        let filter = format!("eq.{}", id);
        let rows: Vec<CommentRow> = self
            .read("get_comment", || {
                self.request(Method::GET, &url, None)
                    .query(&[("select", COMMENT_COLUMNS), ("id", filter.as_str())])
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn get_profile(&self, user_id: &UserId) -> Result<Option<Profile>, BackendError> {
        let url = self.table_url("profiles");
        let filter = format!("eq.{}", user_id);
        let rows: Vec<Profile> = self
            .read("get_profile", || {
                self.request(Method::GET, &url, None)
                    .query(&[("select", PROFILE_COLUMNS), ("id", filter.as_str())])
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn update_profile(
        &self,
        session: &Session,
        display_name: &str,
    ) -> Result<Profile, BackendError> {
        let url = self.table_url("profiles");
        let response = self
            .request(Method::PATCH, &url, Some(session))
            .query(&[
                ("id", format!("eq.{}", session.user_id)),
                ("select", PROFILE_COLUMNS.to_string()),
            ])
            .header("Prefer", "return=representation")
            .json(&json!({ "username": display_name }))
            .send()
            .await?;

        let rows: Vec<Profile> = Self::handle_response(response).await?;
        rows.into_iter().next().ok_or_else(|| {
            BackendError::InvalidResponse(format!("no profile row for {}", session.user_id))
        })
    }

    async fn insert_post(&self, session: &Session, post: &NewPost) -> Result<(), BackendError> {
        let url = self.table_url("posts");
        let response = self
            .request(Method::POST, &url, Some(session))
            .header("Prefer", "return=minimal")
            .json(post)
            .send()
            .await?;

        Self::check_response(response).await
    }

    async fn upload_blob(
        &self,
        session: &Session,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<BlobRef, BackendError> {
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.bucket, path
        );
        let response = self
            .request(Method::POST, &url, Some(session))
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;

        Self::check_response(response).await?;
        Ok(BlobRef {
            path: path.to_string(),
            public_ref: self.public_url(path),
        })
    }

    async fn increment_vote(&self, session: &Session, post_id: PostId) -> Result<(), BackendError> {
        let url = format!("{}/rest/v1/rpc/increment_post_votes", self.base_url);
        let response = self
            .request(Method::POST, &url, Some(session))
            .json(&json!({ "p_post_id": post_id }))
            .send()
            .await?;

        Self::check_response(response)
            .await
            .inspect_err(|e| warn!(post_id = %post_id, error = %e, "increment rejected"))
    }

    async fn insert_comment(
        &self,
        session: &Session,
        post_id: PostId,
        content: &str,
    ) -> Result<CommentRow, BackendError> {
        #[derive(Serialize)]
        struct NewComment<'a> {
            post_id: PostId,
            user_id: &'a UserId,
            content: &'a str,
        }

        let url = self.table_url("comments");
        let response = self
            .request(Method::POST, &url, Some(session))
            .query(&[("select", COMMENT_COLUMNS)])
            .header("Prefer", "return=representation")
            .json(&NewComment {
                post_id,
                user_id: &session.user_id,
                content,
            })
            .send()
            .await?;

        let rows: Vec<CommentRow> = Self::handle_response(response).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::InvalidResponse("insert returned no comment row".into()))
    }
}

/// Error body shapes used across PostgREST, GoTrue and Storage.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

impl ApiErrorBody {
    fn into_message(self) -> Option<String> {
        self.message
            .or(self.msg)
            .or(self.error_description)
            .or(self.error)
    }
}

/// Session grant returned by `/auth/v1/verify`.
#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: GrantUser,
}

#[derive(Debug, Deserialize)]
struct GrantUser {
    id: UserId,
    email: Option<String>,
}

impl TokenGrant {
    fn into_session(self) -> Session {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Utc.timestamp_opt(at, 0).single(),
            (None, Some(secs)) => Some(Utc::now() + chrono::Duration::seconds(secs)),
            (None, None) => None,
        };
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            user_id: self.user.id,
            email: self.user.email,
            expires_at,
        }
    }
}

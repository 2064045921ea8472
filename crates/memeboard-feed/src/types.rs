//! Core types for feed records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Name rendered for comment authors and profiles without a display name.
pub const ANONYMOUS_NAME: &str = "anonymous";

/// Minimum display name length, in characters.
pub const DISPLAY_NAME_MIN: usize = 2;

/// Maximum display name length, in characters.
pub const DISPLAY_NAME_MAX: usize = 30;

/// Identifier of a post, assigned by the authoritative store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub i64);

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a comment, assigned by the authoritative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub i64);

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user account (opaque, issued by the auth service).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Session information from authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user_id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether the access token has passed its expiry time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A user profile row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(rename = "username", default)]
    pub display_name: Option<String>,
    #[serde(rename = "avatar_url", default)]
    pub avatar_ref: Option<String>,
}

impl Profile {
    /// Display name, or [`ANONYMOUS_NAME`] when unset.
    pub fn name_or_anonymous(&self) -> &str {
        display_name_or_anonymous(self.display_name.as_deref())
    }
}

fn display_name_or_anonymous(name: Option<&str>) -> &str {
    match name {
        Some(name) if !name.trim().is_empty() => name,
        _ => ANONYMOUS_NAME,
    }
}

/// A post row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "image_url")]
    pub image_ref: String,
    #[serde(rename = "user_id")]
    pub author_id: UserId,
    #[serde(rename = "votes", default, deserialize_with = "null_as_zero")]
    pub vote_count: u64,
}

/// A null vote count reads as zero.
fn null_as_zero<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or_default())
}

/// A partial post, as delivered by change-feed update payloads.
///
/// Only `id` is required; every other field overlays the stored record
/// when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostPatch {
    pub id: PostId,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "image_url", default)]
    pub image_ref: Option<String>,
    #[serde(rename = "user_id", default)]
    pub author_id: Option<UserId>,
    #[serde(rename = "votes", default)]
    pub vote_count: Option<u64>,
}

impl PostPatch {
    /// A patch that carries only a vote count.
    pub fn votes(id: PostId, vote_count: u64) -> Self {
        Self {
            id,
            vote_count: Some(vote_count),
            ..Self::default()
        }
    }

    /// Overlay the present fields onto `post`, returning the merged record.
    pub fn overlay(&self, post: &Post) -> Post {
        Post {
            id: post.id,
            created_at: self.created_at.unwrap_or(post.created_at),
            title: self.title.clone().or_else(|| post.title.clone()),
            image_ref: self
                .image_ref
                .clone()
                .unwrap_or_else(|| post.image_ref.clone()),
            author_id: self
                .author_id
                .clone()
                .unwrap_or_else(|| post.author_id.clone()),
            vote_count: self.vote_count.unwrap_or(post.vote_count),
        }
    }
}

/// A comment as held in the entity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub author_id: UserId,
    pub author_display_name: Option<String>,
}

impl Comment {
    /// Author display name, or [`ANONYMOUS_NAME`] when the join had none.
    pub fn author_name(&self) -> &str {
        display_name_or_anonymous(self.author_display_name.as_deref())
    }

    /// Sort key: `created_at` ascending, ties broken by `id` ascending.
    pub fn order_key(&self) -> (DateTime<Utc>, CommentId) {
        (self.created_at, self.id)
    }
}

/// Embedded `profiles(username)` join on a comment row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorJoin {
    #[serde(default)]
    pub username: Option<String>,
}

/// A comment row as returned by the relational store, author join included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRow {
    pub id: CommentId,
    pub post_id: PostId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub user_id: UserId,
    #[serde(default)]
    pub profiles: Option<AuthorJoin>,
}

impl CommentRow {
    /// Convert into a stored comment, using `fallback_name` when the join
    /// carried no display name.
    pub fn into_comment(self, fallback_name: Option<&str>) -> Comment {
        let joined = self
            .profiles
            .and_then(|p| p.username)
            .filter(|name| !name.trim().is_empty());
        Comment {
            id: self.id,
            post_id: self.post_id,
            content: self.content,
            created_at: self.created_at,
            author_id: self.user_id,
            author_display_name: joined.or_else(|| fallback_name.map(str::to_string)),
        }
    }
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        row.into_comment(None)
    }
}

/// Fields for a new post insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPost {
    pub title: String,
    #[serde(rename = "image_url")]
    pub image_ref: String,
    #[serde(rename = "user_id")]
    pub author_id: UserId,
}

/// A public reference to an uploaded blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub path: String,
    pub public_ref: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn post() -> Post {
        Post {
            id: PostId(1),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            title: Some("cat".to_string()),
            image_ref: "https://cdn/cat.png".to_string(),
            author_id: UserId::from("u1"),
            vote_count: 5,
        }
    }

    #[test]
    fn test_overlay_only_touches_present_fields() {
        let merged = PostPatch::votes(PostId(1), 9).overlay(&post());
        assert_eq!(merged.vote_count, 9);
        assert_eq!(merged.title.as_deref(), Some("cat"));
        assert_eq!(merged.image_ref, "https://cdn/cat.png");
    }

    #[test]
    fn test_post_row_deserializes_store_columns() {
        let json = r#"{
            "id": 7,
            "created_at": "2025-01-01T00:00:00+00:00",
            "title": null,
            "image_url": "https://cdn/x.jpg",
            "user_id": "abc",
            "votes": 3
        }"#;
        let post: Post = serde_json::from_str(json).unwrap();
        assert_eq!(post.id, PostId(7));
        assert_eq!(post.vote_count, 3);
        assert!(post.title.is_none());
    }

    #[test]
    fn test_post_row_missing_or_null_votes_read_as_zero() {
        for votes in [r#", "votes": null"#, ""] {
            let json = format!(
                r#"{{"id": 8, "created_at": "2025-01-01T00:00:00+00:00", "image_url": "https://cdn/y.png", "user_id": "abc"{}}}"#,
                votes
            );
            let post: Post = serde_json::from_str(&json).unwrap();
            assert_eq!(post.vote_count, 0);
        }
    }

    #[test]
    fn test_comment_row_falls_back_to_local_name() {
        let row = CommentRow {
            id: CommentId(1),
            post_id: PostId(1),
            content: "hi".to_string(),
            created_at: Utc::now(),
            user_id: UserId::from("u1"),
            profiles: None,
        };
        let comment = row.clone().into_comment(Some("quinn"));
        assert_eq!(comment.author_name(), "quinn");

        let anonymous: Comment = row.into();
        assert_eq!(anonymous.author_name(), ANONYMOUS_NAME);
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let session = Session {
            access_token: "t".to_string(),
            refresh_token: None,
            user_id: UserId::from("u1"),
            email: None,
            expires_at: Some(now - chrono::Duration::seconds(1)),
        };
        assert!(session.is_expired(now));
    }
}

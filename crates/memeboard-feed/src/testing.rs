//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::{mpsc, watch};

use crate::backend::{ChangeEvent, ChangeFeed, ChangeStream, FeedBackend};
use crate::{
    AuthorJoin, BackendError, BlobRef, CommentId, CommentRow, NewPost, Post, PostId, Profile,
    Session, UserId,
};

/// Backend operations that can be gated, failed or counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Call {
    ListPosts,
    ListComments,
    GetComment,
    GetProfile,
    UpdateProfile,
    InsertPost,
    UploadBlob,
    IncrementVote,
    InsertComment,
}

/// Holds calls of one kind until opened.
pub(crate) struct Gate(watch::Sender<bool>);

impl Gate {
    pub(crate) fn open(&self) {
        self.0.send_replace(true);
    }
}

pub(crate) fn session(user: &str) -> Session {
    Session {
        access_token: format!("token-{}", user),
        refresh_token: None,
        user_id: UserId::from(user),
        email: Some(format!("{}@example.com", user)),
        expires_at: None,
    }
}

pub(crate) fn post(id: i64, votes: u64) -> Post {
    Post {
        id: PostId(id),
        created_at: Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
        title: Some(format!("post {}", id)),
        image_ref: format!("https://cdn/{}.png", id),
        author_id: UserId::from("author"),
        vote_count: votes,
    }
}

pub(crate) fn comment_row(id: i64, post_id: i64, secs: i64, name: Option<&str>) -> CommentRow {
    CommentRow {
        id: CommentId(id),
        post_id: PostId(post_id),
        content: format!("comment {}", id),
        created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        user_id: UserId::from("commenter"),
        profiles: Some(AuthorJoin {
            username: name.map(str::to_string),
        }),
    }
}

#[derive(Default)]
struct Rows {
    posts: Vec<Post>,
    comments: Vec<CommentRow>,
    profiles: HashMap<UserId, Profile>,
    uploads: Vec<String>,
    omit_author_join: bool,
}

/// Scripted [`FeedBackend`] holding authoritative rows in memory.
pub(crate) struct ScriptedBackend {
    rows: Mutex<Rows>,
    failures: Mutex<HashMap<Call, String>>,
    gates: Mutex<HashMap<Call, watch::Receiver<bool>>>,
    calls: Mutex<HashMap<Call, usize>>,
    next_id: AtomicI64,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Rows::default()),
            failures: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1000),
        })
    }

    pub(crate) fn put_post(&self, post: Post) {
        self.rows.lock().unwrap().posts.push(post);
    }

    pub(crate) fn put_comment(&self, row: CommentRow) {
        self.rows.lock().unwrap().comments.push(row);
    }

    pub(crate) fn put_profile(&self, profile: Profile) {
        self.rows
            .lock()
            .unwrap()
            .profiles
            .insert(profile.id.clone(), profile);
    }

    pub(crate) fn omit_author_join(&self) {
        self.rows.lock().unwrap().omit_author_join = true;
    }

    pub(crate) fn votes(&self, id: PostId) -> Option<u64> {
        let rows = self.rows.lock().unwrap();
        rows.posts.iter().find(|p| p.id == id).map(|p| p.vote_count)
    }

    pub(crate) fn uploads(&self) -> Vec<String> {
        self.rows.lock().unwrap().uploads.clone()
    }

    /// Fail every call of this kind until [`recover`](Self::recover).
    pub(crate) fn fail(&self, call: Call) {
        self.failures
            .lock()
            .unwrap()
            .insert(call, format!("{:?} failed", call));
    }

    pub(crate) fn recover(&self, call: Call) {
        self.failures.lock().unwrap().remove(&call);
    }

    /// Hold calls of this kind until the returned gate opens.
    pub(crate) fn gate(&self, call: Call) -> Gate {
        let (tx, rx) = watch::channel(false);
        self.gates.lock().unwrap().insert(call, rx);
        Gate(tx)
    }

    pub(crate) fn calls(&self, call: Call) -> usize {
        self.calls.lock().unwrap().get(&call).copied().unwrap_or(0)
    }

    async fn enter(&self, call: Call) -> Result<(), BackendError> {
        *self.calls.lock().unwrap().entry(call).or_default() += 1;

        let gate = self.gates.lock().unwrap().get(&call).cloned();
        if let Some(mut gate) = gate {
            // A dropped gate counts as open.
            let _ = gate.wait_for(|open| *open).await;
        }

        match self.failures.lock().unwrap().get(&call) {
            Some(message) => Err(BackendError::Api {
                status: 500,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn join_for(&self, user_id: &UserId) -> Option<AuthorJoin> {
        let rows = self.rows.lock().unwrap();
        if rows.omit_author_join {
            return None;
        }
        Some(AuthorJoin {
            username: rows
                .profiles
                .get(user_id)
                .and_then(|p| p.display_name.clone()),
        })
    }
}

#[async_trait]
impl FeedBackend for ScriptedBackend {
    async fn list_posts(&self) -> Result<Vec<Post>, BackendError> {
        self.enter(Call::ListPosts).await?;
        let mut posts = self.rows.lock().unwrap().posts.clone();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(posts)
    }

    async fn list_comments(&self, post_ids: &[PostId]) -> Result<Vec<CommentRow>, BackendError> {
        self.enter(Call::ListComments).await?;
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .comments
            .iter()
            .filter(|c| post_ids.contains(&c.post_id))
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    async fn get_comment(&self, id: CommentId) -> Result<Option<CommentRow>, BackendError> {
        self.enter(Call::GetComment).await?;
        let rows = self.rows.lock().unwrap();
        Ok(rows.comments.iter().find(|c| c.id == id).cloned())
    }

    async fn get_profile(&self, user_id: &UserId) -> Result<Option<Profile>, BackendError> {
        self.enter(Call::GetProfile).await?;
        Ok(self.rows.lock().unwrap().profiles.get(user_id).cloned())
    }

    async fn update_profile(
        &self,
        session: &Session,
        display_name: &str,
    ) -> Result<Profile, BackendError> {
        self.enter(Call::UpdateProfile).await?;
        let profile = Profile {
            id: session.user_id.clone(),
            display_name: Some(display_name.to_string()),
            avatar_ref: None,
        };
        self.put_profile(profile.clone());
        Ok(profile)
    }

    async fn insert_post(&self, session: &Session, post: &NewPost) -> Result<(), BackendError> {
        self.enter(Call::InsertPost).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.put_post(Post {
            id: PostId(id),
            created_at: Utc.timestamp_opt(1_800_000_000 + id, 0).unwrap(),
            title: Some(post.title.clone()),
            image_ref: post.image_ref.clone(),
            author_id: session.user_id.clone(),
            vote_count: 0,
        });
        Ok(())
    }

    async fn upload_blob(
        &self,
        _session: &Session,
        path: &str,
        _bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<BlobRef, BackendError> {
        self.enter(Call::UploadBlob).await?;
        self.rows.lock().unwrap().uploads.push(path.to_string());
        Ok(BlobRef {
            path: path.to_string(),
            public_ref: format!("https://cdn/memes/{}", path),
        })
    }

    async fn increment_vote(&self, _session: &Session, post_id: PostId) -> Result<(), BackendError> {
        self.enter(Call::IncrementVote).await?;
        let mut rows = self.rows.lock().unwrap();
        match rows.posts.iter_mut().find(|p| p.id == post_id) {
            Some(post) => {
                post.vote_count += 1;
                Ok(())
            }
            None => Err(BackendError::Api {
                status: 404,
                message: format!("post {} not found", post_id),
            }),
        }
    }

    async fn insert_comment(
        &self,
        session: &Session,
        post_id: PostId,
        content: &str,
    ) -> Result<CommentRow, BackendError> {
        self.enter(Call::InsertComment).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let row = CommentRow {
            id: CommentId(id),
            post_id,
            content: content.to_string(),
            created_at: Utc.timestamp_opt(1_800_000_000 + id, 0).unwrap(),
            user_id: session.user_id.clone(),
            profiles: self.join_for(&session.user_id),
        };
        self.put_comment(row.clone());
        Ok(row)
    }
}

/// [`ChangeFeed`] whose connections are handed to the test.
pub(crate) struct ChannelFeed {
    connections: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<ChangeStream, String>>>,
}

/// Test side of a [`ChannelFeed`].
pub(crate) struct FeedControl {
    tx: mpsc::UnboundedSender<Result<ChangeStream, String>>,
}

impl FeedControl {
    /// Let the next connect succeed; returns the sender for its events.
    pub(crate) fn accept(&self) -> mpsc::Sender<Result<ChangeEvent, BackendError>> {
        let (tx, rx) = mpsc::channel(16);
        let _ = self.tx.send(Ok(ChangeStream::new(rx)));
        tx
    }

    /// Make the next connect fail.
    pub(crate) fn refuse(&self) {
        let _ = self.tx.send(Err("connection refused".to_string()));
    }
}

pub(crate) fn channel_feed() -> (Arc<ChannelFeed>, FeedControl) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ChannelFeed {
            connections: tokio::sync::Mutex::new(rx),
        }),
        FeedControl { tx },
    )
}

#[async_trait]
impl ChangeFeed for ChannelFeed {
    async fn connect(&self) -> Result<ChangeStream, BackendError> {
        match self.connections.lock().await.recv().await {
            Some(Ok(stream)) => Ok(stream),
            Some(Err(message)) => Err(BackendError::WebSocket(message)),
            None => std::future::pending().await,
        }
    }
}

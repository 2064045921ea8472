//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use memeboard_feed::{FeedApp, FeedError, FeedSnapshot, PostId, RealtimeClient, RestClient, Session};
use miette::Result;
use tracing::{info, warn};

use crate::BackendArgs;
use crate::session_file::SessionFile;

/// Clients and persisted state shared by every subcommand.
pub struct Context {
    client: Arc<RestClient>,
    base_url: String,
    anon_key: String,
    realtime_url: Option<String>,
    sessions: SessionFile,
}

impl Context {
    pub fn new(args: &BackendArgs) -> Result<Self> {
        let client = RestClient::new(&args.url, &args.anon_key)
            .map_err(|e| miette::miette!("failed to create HTTP client: {}", e))?
            .with_bucket(&args.bucket);
        let session_path = match &args.session_file {
            Some(path) => path.clone(),
            None => SessionFile::default_path()?,
        };

        Ok(Self {
            client: Arc::new(client),
            base_url: args.url.clone(),
            anon_key: args.anon_key.clone(),
            realtime_url: args.realtime_url.clone(),
            sessions: SessionFile::new(session_path),
        })
    }

    fn app(&self, session: Option<&Session>) -> FeedApp {
        let mut realtime = RealtimeClient::new(&self.base_url, self.anon_key.clone());
        if let Some(endpoint) = &self.realtime_url {
            realtime = realtime.with_endpoint(endpoint.clone());
        }
        if let Some(session) = session {
            realtime = realtime.with_access_token(session.access_token.clone());
        }
        FeedApp::new(self.client.clone(), Arc::new(realtime))
    }

    /// The stored session, refreshed if it has expired.
    async fn session(&self) -> Result<Option<Session>> {
        let Some(session) = self.sessions.load().await? else {
            return Ok(None);
        };
        if !session.is_expired(Utc::now()) {
            return Ok(Some(session));
        }

        info!(user_id = %session.user_id, "session expired, refreshing");
        match self.client.refresh_session(&session).await {
            Ok(fresh) => {
                self.sessions.save(&fresh).await?;
                Ok(Some(fresh))
            }
            Err(e) => {
                warn!(error = %e, "session refresh failed");
                self.sessions.clear().await?;
                Err(miette::miette!("session expired; run `memeboard login` again"))
            }
        }
    }

    async fn require_session(&self) -> Result<Session> {
        self.session().await?.ok_or_else(|| report(FeedError::AuthRequired))
    }

    /// Signed-in app with the feed loaded.
    async fn signed_in_app(&self) -> Result<FeedApp> {
        let session = self.require_session().await?;
        let app = self.app(Some(&session));
        app.set_session(Some(session)).await;
        app.refresh().await.map_err(report)?;
        Ok(app)
    }

    pub async fn login(&self, email: &str) -> Result<()> {
        let email = email.trim();
        self.client
            .send_otp(email)
            .await
            .map_err(|e| miette::miette!("failed to send sign-in code: {}", e))?;

        eprint!("Code sent to {}. Enter it: ", email);
        let code = tokio::task::spawn_blocking(rpassword::read_password)
            .await
            .map_err(|e| miette::miette!("code prompt failed: {}", e))?
            .map_err(|e| miette::miette!("failed to read code: {}", e))?;

        let session = self
            .client
            .verify_otp(email, code.trim())
            .await
            .map_err(|e| miette::miette!("sign-in failed: {}", e))?;
        self.sessions.save(&session).await?;

        println!("Signed in as {}", email);
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        let Some(session) = self.sessions.load().await? else {
            println!("Not signed in");
            return Ok(());
        };

        if let Err(e) = self.client.sign_out(&session).await {
            warn!(error = %e, "sign-out request failed, forgetting session anyway");
        }
        self.sessions.clear().await?;
        println!("Signed out");
        Ok(())
    }

    pub async fn feed(&self, with_comments: bool) -> Result<()> {
        let app = self.app(None);
        app.refresh().await.map_err(report)?;
        print!("{}", render_feed(&app.snapshot(), with_comments));
        Ok(())
    }

    pub async fn watch(&self) -> Result<()> {
        let session = self.session().await?;
        let app = self.app(session.as_ref());
        if let Err(e) = app.start(session).await {
            warn!(error = %e, "initial load failed, waiting for live updates");
        }
        print!("{}", render_feed(&app.snapshot(), false));

        let mut snapshots = app.subscribe();
        let Some(mut state) = app.subscribe_state().await else {
            return Err(miette::miette!("change feed did not start"));
        };
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("received shutdown signal");
                    break;
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    info!(
                        posts = snapshot.post_count(),
                        comments = snapshot.comment_count(),
                        held = snapshot.held_comment_count(),
                        "feed updated"
                    );
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state.borrow_and_update();
                    info!(state = %current, "change feed");
                }
            }
        }

        app.shutdown().await;
        Ok(())
    }

    pub async fn vote(&self, post_id: i64) -> Result<()> {
        let app = self.signed_in_app().await?;
        let post_id = PostId(post_id);
        app.vote(post_id).await.map_err(report)?;

        let votes = app
            .snapshot()
            .post(post_id)
            .map(|p| p.vote_count)
            .unwrap_or_default();
        println!("Voted on post {} ({} votes)", post_id, votes);
        Ok(())
    }

    pub async fn comment(&self, post_id: i64, text: &str) -> Result<()> {
        let app = self.signed_in_app().await?;
        let comment = app
            .submit_comment(PostId(post_id), text)
            .await
            .map_err(report)?;
        println!(
            "Comment {} posted on post {} as {}",
            comment.id,
            comment.post_id,
            comment.author_name()
        );
        Ok(())
    }

    pub async fn upload(&self, file: &Path, title: Option<&str>) -> Result<()> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| miette::miette!("failed to read {}: {}", file.display(), e))?;
        let file_name = file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| miette::miette!("{} has no usable file name", file.display()))?;

        let app = self.signed_in_app().await?;
        let blob = app
            .upload_post(file_name, bytes, title)
            .await
            .map_err(report)?;
        println!("Uploaded {}", blob.public_ref);
        Ok(())
    }

    pub async fn set_name(&self, name: &str) -> Result<()> {
        let session = self.require_session().await?;
        let app = self.app(Some(&session));
        app.set_session(Some(session)).await;

        let profile = app.edit_display_name(name).await.map_err(report)?;
        println!("Display name set to {}", profile.name_or_anonymous());
        Ok(())
    }
}

fn report(e: FeedError) -> miette::Report {
    match e {
        FeedError::AuthRequired => miette::miette!("not signed in; run `memeboard login <email>`"),
        FeedError::DisplayNameRequired => {
            miette::miette!("set a display name first: `memeboard set-name <name>`")
        }
        other => miette::miette!("{}", other),
    }
}

fn render_feed(snapshot: &FeedSnapshot, with_comments: bool) -> String {
    let mut out = String::new();
    if snapshot.post_count() == 0 {
        out.push_str("No posts yet\n");
        return out;
    }

    for post in snapshot.posts() {
        let title = post.title.as_deref().unwrap_or("(untitled)");
        out.push_str(&format!(
            "#{} {} [{} votes] {}\n",
            post.id, title, post.vote_count, post.image_ref
        ));
        if with_comments {
            for comment in snapshot.comments(post.id) {
                out.push_str(&format!("    {}: {}\n", comment.author_name(), comment.content));
            }
        }
    }
    out
}

//! memeboard: command-line client for the meme feed.
//!
//! Subcommands:
//! - `login` / `logout`: email one-time-code sign-in
//! - `feed`: print posts with their comments
//! - `watch`: follow live updates until Ctrl-C
//! - `vote`, `comment`, `upload`, `set-name`: feed actions

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod session_file;

#[derive(Parser)]
#[command(name = "memeboard")]
#[command(about = "Meme feed client", long_about = None)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Hosted backend connection settings.
#[derive(Args)]
pub struct BackendArgs {
    /// Project URL
    #[arg(long, env = "MEMEBOARD_URL")]
    pub url: String,

    /// Public (anon) API key
    #[arg(long, env = "MEMEBOARD_ANON_KEY", hide_env_values = true)]
    pub anon_key: String,

    /// Storage bucket for uploaded images
    #[arg(long, env = "MEMEBOARD_BUCKET", default_value = memeboard_feed::DEFAULT_BUCKET)]
    pub bucket: String,

    /// Realtime WebSocket endpoint (derived from the project URL if unset)
    #[arg(long, env = "MEMEBOARD_REALTIME_URL")]
    pub realtime_url: Option<String>,

    /// Session file (defaults to the user config directory)
    #[arg(long, env = "MEMEBOARD_SESSION_FILE")]
    pub session_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a code sent to your email
    Login {
        /// Account email
        email: String,
    },

    /// Sign out and forget the stored session
    Logout,

    /// Print the feed
    Feed {
        /// Hide comments
        #[arg(long)]
        no_comments: bool,
    },

    /// Follow live updates until interrupted
    Watch,

    /// Upvote a post
    Vote {
        /// Post id
        post_id: i64,
    },

    /// Comment on a post
    Comment {
        /// Post id
        post_id: i64,

        /// Comment text
        text: String,
    },

    /// Upload an image as a new post
    Upload {
        /// Image file
        file: PathBuf,

        /// Post title (defaults to the file name)
        #[arg(long)]
        title: Option<String>,
    },

    /// Set your display name
    SetName {
        /// New display name (2 to 30 characters)
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "memeboard=info,memeboard_feed=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context::new(&cli.backend)?;

    match cli.command {
        Commands::Login { email } => ctx.login(&email).await,
        Commands::Logout => ctx.logout().await,
        Commands::Feed { no_comments } => ctx.feed(!no_comments).await,
        Commands::Watch => ctx.watch().await,
        Commands::Vote { post_id } => ctx.vote(post_id).await,
        Commands::Comment { post_id, text } => ctx.comment(post_id, &text).await,
        Commands::Upload { file, title } => ctx.upload(&file, title.as_deref()).await,
        Commands::SetName { name } => ctx.set_name(&name).await,
    }
}

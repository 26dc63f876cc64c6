//! Command handlers.
//!
//! [`run`] maps each parsed [`Command`] to its handler. Handlers write
//! user-facing output to `out` and return errors to the caller.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::error;

use crate::aggregator::{parse_interval, Aggregator};
use crate::cli::Command;
use crate::config::Config;
use crate::db::{Database, Feed, User};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;

/// Everything a command needs: the database and the loaded config.
pub struct State {
    pub db: Arc<Database>,
    pub config: Config,
    /// Where `config` is persisted on login/register
    pub config_path: PathBuf,
}

pub async fn run<W: Write>(state: &mut State, command: Command, out: &mut W) -> Result<()> {
    match command {
        Command::Login { username } => login(state, &username, out).await,
        Command::Register { username } => register(state, &username, out).await,
        Command::Reset => reset(state, out).await,
        Command::Users => users(state, out).await,
        Command::AddFeed { name, url } => add_feed(state, &name, &url, out).await,
        Command::Feeds => feeds(state, out).await,
        Command::Follow { url } => follow(state, &url, out).await,
        Command::Following => following(state, out).await,
        Command::Unfollow { url } => unfollow(state, &url, out).await,
        Command::Agg { interval, workers } => agg(state, &interval, workers, out).await,
        Command::Browse { limit } => browse(state, limit, out).await,
    }
}

/// The logged-in user, who must still exist in the database.
async fn current_user(state: &State) -> Result<User> {
    let name = state
        .config
        .current_user_name
        .as_deref()
        .ok_or_else(|| Error::NotFound("logged-in user (run `gator login <name>`)".to_string()))?;

    state
        .db
        .get_user_by_name(name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user '{}'", name)))
}

async fn feed_by_url(state: &State, url: &str) -> Result<Feed> {
    state
        .db
        .get_feed_by_url(url)
        .await?
        .ok_or_else(|| Error::NotFound(format!("feed with url '{}'", url)))
}

async fn login<W: Write>(state: &mut State, username: &str, out: &mut W) -> Result<()> {
    let user = state
        .db
        .get_user_by_name(username)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user '{}'", username)))?;

    state.config.set_user(&user.name, &state.config_path)?;
    writeln!(out, "Logged in as {}", user.name)?;
    Ok(())
}

async fn register<W: Write>(state: &mut State, username: &str, out: &mut W) -> Result<()> {
    let user = state.db.create_user(username).await?;
    state.config.set_user(&user.name, &state.config_path)?;

    writeln!(out, "User created: {} (id {})", user.name, user.id)?;
    writeln!(out, "Logged in as {}", user.name)?;
    Ok(())
}

async fn reset<W: Write>(state: &State, out: &mut W) -> Result<()> {
    state.db.reset().await?;
    writeln!(out, "Database reset")?;
    Ok(())
}

async fn users<W: Write>(state: &State, out: &mut W) -> Result<()> {
    let current = state.config.current_user_name.as_deref();
    for user in state.db.list_users().await? {
        if Some(user.name.as_str()) == current {
            writeln!(out, "* {} (current)", user.name)?;
        } else {
            writeln!(out, "* {}", user.name)?;
        }
    }
    Ok(())
}

async fn add_feed<W: Write>(state: &State, name: &str, url: &str, out: &mut W) -> Result<()> {
    let user = current_user(state).await?;
    let feed = state.db.create_feed(name, url, user.id).await?;
    state.db.create_feed_follow(user.id, feed.id).await?;

    writeln!(out, "Feed created: {} ({})", feed.name, feed.url)?;
    writeln!(out, "{} now follows {}", user.name, feed.name)?;
    Ok(())
}

async fn feeds<W: Write>(state: &State, out: &mut W) -> Result<()> {
    for feed in state.db.list_feeds_with_owner().await? {
        writeln!(out, "* {} ({}) added by {}", feed.name, feed.url, feed.owner_name)?;
    }
    Ok(())
}

async fn follow<W: Write>(state: &State, url: &str, out: &mut W) -> Result<()> {
    let user = current_user(state).await?;
    let feed = feed_by_url(state, url).await?;
    state.db.create_feed_follow(user.id, feed.id).await?;

    writeln!(out, "{} now follows {}", user.name, feed.name)?;
    Ok(())
}

async fn following<W: Write>(state: &State, out: &mut W) -> Result<()> {
    let user = current_user(state).await?;
    for feed in state.db.list_followed_feeds(user.id).await? {
        writeln!(out, "* {}", feed.name)?;
    }
    Ok(())
}

async fn unfollow<W: Write>(state: &State, url: &str, out: &mut W) -> Result<()> {
    let user = current_user(state).await?;
    let feed = feed_by_url(state, url).await?;

    if !state.db.delete_feed_follow(user.id, feed.id).await? {
        return Err(Error::NotFound(format!(
            "follow of '{}' by {}",
            feed.name, user.name
        )));
    }

    writeln!(out, "{} unfollowed {}", user.name, feed.name)?;
    Ok(())
}

async fn agg<W: Write>(state: &State, interval: &str, workers: usize, out: &mut W) -> Result<()> {
    let interval = parse_interval(interval)?;
    if workers == 0 {
        return Err(Error::Argument("workers must be at least 1".to_string()));
    }

    let fetcher = Fetcher::new(&state.config.fetch)?;
    let aggregator =
        Aggregator::new(state.db.clone(), Arc::new(fetcher), interval).with_workers(workers);

    writeln!(out, "Collecting feeds every {:?}", interval)?;
    out.flush()?;

    aggregator.run_until(shutdown_signal()).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn browse<W: Write>(state: &State, limit: u32, out: &mut W) -> Result<()> {
    if limit == 0 {
        return Err(Error::Argument("limit must be at least 1".to_string()));
    }

    let user = current_user(state).await?;
    let posts = state.db.list_posts_for_user(user.id, i64::from(limit)).await?;
    if posts.is_empty() {
        writeln!(out, "No posts yet. Run `gator agg <interval>` to fetch some.")?;
        return Ok(());
    }

    for post in posts {
        let published = post
            .published_at
            .map(|p| p.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown date".to_string());
        writeln!(out, "{} | {}", published, post.title)?;
        writeln!(out, "    {}", post.url)?;
    }
    Ok(())
}

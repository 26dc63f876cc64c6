use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "gator")]
#[command(about = "Gator - a command line RSS feed aggregator")]
#[command(version)]
pub struct Cli {
    /// Path to the config file (defaults to ~/.gatorconfig.toml)
    #[arg(long, global = true, env = "GATOR_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in as an existing user
    Login { username: String },
    /// Create a user and log in as them
    Register { username: String },
    /// Delete all users, feeds, follows and posts
    Reset,
    /// List users
    Users,
    /// Add a feed and follow it
    #[command(name = "addfeed")]
    AddFeed { name: String, url: String },
    /// List all feeds with their owners
    Feeds,
    /// Follow an existing feed
    Follow { url: String },
    /// List the feeds you follow
    Following,
    /// Stop following a feed
    Unfollow { url: String },
    /// Fetch feeds forever, one every <interval> (e.g. 30s, 1m, 1h)
    Agg {
        interval: String,
        /// Feeds fetched concurrently per tick
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Show the newest posts from the feeds you follow
    Browse {
        #[arg(default_value_t = 2)]
        limit: u32,
    },
}

//! CLI command definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Group chat API server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database URL. Without one the server keeps everything in memory.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Huddle server
    Serve {
        /// Address to bind to
        #[arg(short, long, env = "HUDDLE_BIND", default_value = "0.0.0.0:4000")]
        bind: String,

        /// Token signing secret (at least 32 bytes). A random one is used if unset.
        #[arg(long, env = "HUDDLE_SECRET")]
        secret: Option<String>,

        /// Token lifetime in seconds. Tokens never expire by age if unset.
        #[arg(long, env = "HUDDLE_TOKEN_TTL_SECS")]
        token_ttl_secs: Option<u64>,

        /// Re-check group membership for every live messageAdded event
        #[arg(long, env = "HUDDLE_REVALIDATE_MEMBERSHIP")]
        revalidate_membership: bool,

        /// Close a user's open sockets when they log out or change password
        #[arg(long, env = "HUDDLE_REVOKE_LIVE_SOCKETS")]
        revoke_live_sockets: bool,
    },

    /// Initialize database schema
    Init,

    /// Show status
    Status,
}

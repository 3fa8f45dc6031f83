use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

/// yourVPN: pay-as-you-go VPN endpoints
#[derive(Parser)]
#[command(name = "yvpn", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server and billing scheduler
    Serve {
        /// Port to bind (defaults to YVPN_PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Keep the ledger in memory instead of PostgreSQL
        #[arg(long)]
        ephemeral: bool,
    },

    /// Manage tokens directly in the ledger
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Create a new token
    Create {
        #[arg(long)]
        funds: Decimal,
        #[arg(long, default_value = "30")]
        days: i64,
        /// Grant access to the /tokens admin routes
        #[arg(long)]
        admin: bool,
    },
    /// List tokens, oldest first
    List {
        #[arg(long, default_value = "0")]
        skip: i64,
        #[arg(long, default_value = "100")]
        limit: i64,
    },
    /// Destroy a token's endpoints, then the token
    Delete {
        #[arg(long)]
        token: String,
    },
}

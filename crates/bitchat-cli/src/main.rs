//! BitChat Command-Line Interface
//!
//! A terminal client for the BitChat core: identity management,
//! contacts, chat history, and the panic wipe. Identity is generated
//! automatically on first run.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// BitChat - private peer-to-peer messaging over local radios
#[derive(Parser)]
#[command(name = "bitchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "~/.bitchat")]
    data_dir: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new identity (happens automatically on first run)
    Init {
        /// Force overwrite existing identity
        #[arg(short, long)]
        force: bool,
    },

    /// Show current identity information
    Identity,

    /// Print the contact-add QR URI for this identity
    Qr,

    /// Add a contact by hash id or QR URI
    Add {
        /// `bitchat://add/...` URI or bare 8-character hash id
        target: String,

        /// Local name for the contact
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List contacts
    Contacts,

    /// Block a contact
    Block {
        /// Contact's hash id
        hash_id: String,
    },

    /// Unblock a contact
    Unblock {
        /// Contact's hash id
        hash_id: String,
    },

    /// Mark or unmark a contact as favorite
    Favorite {
        /// Contact's hash id
        hash_id: String,

        /// Remove the favorite mark instead of setting it
        #[arg(long)]
        remove: bool,
    },

    /// Send a message to a peer address
    Send {
        /// Peer's transport address
        address: String,

        /// Message text
        message: String,
    },

    /// Show chat history with a peer
    History {
        /// Peer's transport address
        address: String,

        /// Number of messages to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Search stored messages
    Search {
        /// Substring to look for (case-insensitive)
        query: String,

        /// Restrict to one peer address
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Show or change preferences
    Prefs {
        /// Enable or disable durable message storage (true/false)
        #[arg(long)]
        persistence: Option<bool>,

        /// Message retention window in days
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Destroy all local data immediately
    Wipe {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let data_dir = commands::expand_data_dir(&cli.data_dir);

    match cli.command {
        Some(Commands::Init { force }) => commands::init(&data_dir, force).await,
        Some(Commands::Identity) | None => commands::identity(&data_dir).await,
        Some(Commands::Qr) => commands::qr(&data_dir).await,
        Some(Commands::Add { target, name }) => commands::add(&data_dir, &target, name).await,
        Some(Commands::Contacts) => commands::contacts(&data_dir).await,
        Some(Commands::Block { hash_id }) => commands::set_blocked(&data_dir, &hash_id, true).await,
        Some(Commands::Unblock { hash_id }) => {
            commands::set_blocked(&data_dir, &hash_id, false).await
        }
        Some(Commands::Favorite { hash_id, remove }) => {
            commands::set_favorite(&data_dir, &hash_id, !remove).await
        }
        Some(Commands::Send { address, message }) => {
            commands::send(&data_dir, &address, &message).await
        }
        Some(Commands::History { address, limit }) => {
            commands::history(&data_dir, &address, limit).await
        }
        Some(Commands::Search { query, address }) => {
            commands::search(&data_dir, &query, address.as_deref()).await
        }
        Some(Commands::Prefs {
            persistence,
            retention_days,
        }) => commands::prefs(&data_dir, persistence, retention_days).await,
        Some(Commands::Wipe { yes }) => commands::wipe(&data_dir, yes).await,
    }
}

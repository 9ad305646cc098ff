//! Headless collaborative-editing client.
//!
//! ```text
//! coedit edit  --doc 7            mirror a document, append stdin lines as edits
//! coedit share --doc 7 --with bob grant access to another user
//! coedit broker                   run the development WAMP broker
//! ```
//!
//! Connection settings come from `WAMP_URL`, `WAMP_REALM` and `API_URL`
//! (a `.env` file is honored); credentials from `--username`/`--password` or
//! `COEDIT_USERNAME`/`COEDIT_PASSWORD`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coedit_sync::auth::{AuthSession, PasswordGrant};
use coedit_sync::broker::{Broker, BrokerConfig};
use coedit_sync::config::SyncConfig;
use coedit_sync::protocol::EditSpan;
use coedit_sync::session::{SyncEvent, SyncHandle, SyncSession};
use coedit_sync::storage::http::HttpStorage;
use coedit_sync::storage::StorageService;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "coedit", about = "Collaborative code editor sync client", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Credentials {
    /// Account name (default: $COEDIT_USERNAME)
    #[arg(short, long)]
    username: Option<String>,

    /// Account password (default: $COEDIT_PASSWORD)
    #[arg(short, long)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a document, print its changes, and append stdin lines to it
    Edit {
        /// Document id
        #[arg(short, long)]
        doc: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Share a document with another user
    Share {
        /// Document id
        #[arg(short, long)]
        doc: String,

        /// User to grant access to
        #[arg(long = "with", value_name = "USERNAME")]
        with: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Run the development WAMP broker
    Broker {
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: String,

        #[arg(short, long, default_value = "realm1")]
        realm: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Edit { doc, credentials } => {
            let config = SyncConfig::from_env()?;
            let auth = login(&config, credentials).await?;
            edit(config, doc, auth).await
        }
        Commands::Share {
            doc,
            with,
            credentials,
        } => {
            let config = SyncConfig::from_env()?;
            let auth = login(&config, credentials).await?;
            let storage = HttpStorage::with_timeout(config.api_url.clone(), auth, config.request_timeout)?;
            storage
                .share(&doc, &with)
                .await
                .with_context(|| format!("sharing document {doc} with {with}"))?;
            println!("Shared document {doc} with {with}");
            Ok(())
        }
        Commands::Broker { bind, realm } => {
            let broker = Broker::new(BrokerConfig {
                bind_addr: bind,
                realm,
            });
            broker.run().await?;
            Ok(())
        }
    }
}

async fn login(config: &SyncConfig, credentials: Credentials) -> Result<Arc<AuthSession>> {
    let username = match credentials.username {
        Some(u) => u,
        None => std::env::var("COEDIT_USERNAME").context("no --username and COEDIT_USERNAME is not set")?,
    };
    let password = match credentials.password {
        Some(p) => p,
        None => std::env::var("COEDIT_PASSWORD").context("no --password and COEDIT_PASSWORD is not set")?,
    };

    let grant = PasswordGrant::with_timeout(config.api_url.clone(), username, password, config.request_timeout)?;
    let auth = AuthSession::login(Arc::new(grant))
        .await
        .context("signing in")?;
    Ok(Arc::new(auth))
}

async fn edit(config: SyncConfig, doc: String, auth: Arc<AuthSession>) -> Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let handle = SyncSession::connect(config, doc.clone(), auth, tx)?;
    log::info!("Opened document {doc} (session {})", handle.session_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(event),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => append_line(&handle, &line).await?,
                None => {
                    stdin_open = false;
                    log::info!("stdin closed; still following {doc}, Ctrl-C to leave");
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.teardown().await;
    while let Ok(event) = events.try_recv() {
        print_event(event);
    }
    Ok(())
}

async fn append_line(handle: &SyncHandle, line: &str) -> Result<()> {
    let snapshot = handle.snapshot().await?;
    if !snapshot.loaded {
        log::warn!("Document is not loaded yet; line discarded");
        return Ok(());
    }
    let end = snapshot.content.chars().count();
    let mut text = String::new();
    if !snapshot.content.is_empty() && !snapshot.content.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
    handle.local_edit(vec![EditSpan::insert(end, text)])?;
    Ok(())
}

fn print_event(event: SyncEvent) {
    match event {
        SyncEvent::ConnectionChanged(connected) => {
            log::info!("{}", if connected { "Connected" } else { "Disconnected" })
        }
        SyncEvent::DocumentLoaded(document) => {
            println!("── {} ({}) ──", document.title, document.language);
            println!("{}", document.content);
        }
        SyncEvent::LoadFailed(e) => log::error!("Could not load document: {e}"),
        SyncEvent::RemoteChange { content, .. } => {
            println!("── remote change ──");
            println!("{content}");
        }
        SyncEvent::PresenceChanged(peers) => {
            let names: Vec<&str> = peers.iter().map(|p| p.username.as_str()).collect();
            log::info!("Also here: {}", if names.is_empty() { "nobody".to_string() } else { names.join(", ") });
        }
        SyncEvent::CursorMoved(update) => {
            log::debug!("{} is at {}", update.username, update.position)
        }
        SyncEvent::SaveStatus(status) => log::info!("Save status: {status:?}"),
    }
}

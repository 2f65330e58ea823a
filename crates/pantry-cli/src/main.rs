mod alerts;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use pantry_client::chat::{ChatUpdate, ChatView};
use pantry_client::checklist::line_key;
use pantry_client::conversation::{CachedMessage, Delivery};
use pantry_client::notify::badge;
use pantry_client::sidebar::Sidebar;
use pantry_client::{ApiClient, ClientConfig, ClientError, CredentialCell, Inbound, Session};
use pantry_store::Database;
use pantry_types::events::ServerEvent;
use pantry_types::models::{MessageId, UserId};

use crate::alerts::TerminalAlerts;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "pantry", version, about = "Pantry recipe chat from the terminal")]
struct Cli {
    /// Treat the terminal as unfocused so incoming messages raise notifications.
    #[arg(long, global = true, default_value_t = false)]
    background: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in and remember the session.
    Login {
        username: String,
        /// Read from stdin when not set.
        #[arg(long, env = "PANTRY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long)]
        mfa_code: Option<String>,
    },
    /// Forget the stored session.
    Logout,
    /// Chat with one user. Lines are sent; /more, /search, /react and /quit
    /// are commands.
    Chat { user_id: i64 },
    /// Print the conversation list once.
    Inbox,
    /// Show a recipe's ingredient checklist, optionally toggling lines.
    Checklist {
        recipe_id: i64,
        #[command(subcommand)]
        action: Option<ChecklistAction>,
    },
}

#[derive(Debug, Subcommand)]
enum ChecklistAction {
    Toggle { lines: Vec<usize> },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pantry=info,pantry_client=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(ClientConfig::from_env()?);
    let store = Arc::new(
        Database::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );
    let sink = Arc::new(TerminalAlerts::new(!cli.background));

    match cli.command {
        Command::Login {
            username,
            password,
            mfa_code,
        } => {
            let password = match password {
                Some(password) => password,
                None => read_line().await?,
            };
            let session = Session::login(
                config,
                store,
                sink,
                &username,
                &password,
                mfa_code.as_deref(),
            )
            .await?;
            info!("logged in as {} ({})", session.user().username, session.user_id());
            session.close().await;
        }
        Command::Logout => {
            // Works without a resumable session too
            let api = ApiClient::new(config, store, CredentialCell::new(None))?;
            api.logout().await?;
            info!("logged out");
        }
        Command::Chat { user_id } => {
            let session = Session::start(config, store, sink)?;
            let result = chat(&session, UserId(user_id)).await;
            session.close().await;
            result?;
        }
        Command::Inbox => {
            let session = Session::start(config, store, sink)?;
            let result = inbox(&session).await;
            session.close().await;
            result?;
        }
        Command::Checklist { recipe_id, action } => {
            let session = Session::start(config, store, sink)?;
            let result = checklist(&session, recipe_id, action).await;
            session.close().await;
            result?;
        }
    }
    Ok(())
}

async fn read_line() -> Result<String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match lines.next_line().await? {
        Some(line) => Ok(line.trim_end().to_string()),
        None => bail!("no password given"),
    }
}

async fn chat(session: &Session, with: UserId) -> Result<()> {
    if let Err(e) = session.wait_connected(CONNECT_TIMEOUT).await {
        warn!("{}; continuing offline", e);
    }
    let me = session.user_id();
    let mut view = session.open_chat(with).await?;

    let mut shown = HashSet::new();
    print_new(&view, me, &mut shown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&mut view, me, &line, &mut shown).await {
                    break;
                }
            }
            updates = view.next_update() => {
                let Some(updates) = updates else { break };
                for update in updates {
                    report(&view, me, update, &mut shown);
                }
            }
        }
    }

    view.close();
    Ok(())
}

/// Returns false when the user asked to leave.
async fn handle_line(
    view: &mut ChatView<ApiClient>,
    me: UserId,
    line: &str,
    shown: &mut HashSet<MessageId>,
) -> bool {
    let line = line.trim();
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    match cmd {
        "" => {}
        "/quit" => return false,
        "/more" => {
            if !view.has_more() {
                println!("-- no older messages");
                return true;
            }
            match view.load_more().await {
                Ok(n) => {
                    println!("-- {} older messages", n);
                    print_new(view, me, shown);
                }
                Err(e) if e.is_transport() => warn!("cannot reach the server: {}", e),
                Err(e) => warn!("could not load older messages: {}", e),
            }
        }
        "/search" => {
            for entry in view.search(rest) {
                println!("{}", render(entry, me));
            }
        }
        "/react" => {
            let Some((id, reaction)) = rest.split_once(' ') else {
                println!("usage: /react <message-id> <emoji>");
                return true;
            };
            let Ok(id) = id.parse::<i64>() else {
                println!("not a message id: {}", id);
                return true;
            };
            if let Err(e) = view.react(MessageId(id), reaction.trim()) {
                warn!("reaction not sent: {}", e);
            }
        }
        _ => {
            // A terminal only sees whole lines; each one is a short burst
            view.keystroke();
            match view.send(line) {
                Ok(_) => {}
                Err(ClientError::InvalidMessage(reason)) => println!("-- {}", reason),
                Err(e) => warn!("{}", e),
            }
        }
    }
    true
}

fn report(view: &ChatView<ApiClient>, me: UserId, update: ChatUpdate, shown: &mut HashSet<MessageId>) {
    match update {
        ChatUpdate::Messages => print_new(view, me, shown),
        ChatUpdate::Confirmed(_) => {}
        ChatUpdate::SendFailed { client_id, reason } => {
            println!("-- message {} failed: {}", client_id, reason)
        }
        ChatUpdate::PeerTyping(true) => println!("-- {} is typing", view.with()),
        ChatUpdate::PeerTyping(false) => {}
        ChatUpdate::PeerPresence(presence) => println!("-- {} is {:?}", view.with(), presence),
        ChatUpdate::ServerError(message) => println!("-- server: {}", message),
        ChatUpdate::Reconnected => println!("-- reconnected"),
        ChatUpdate::Disconnected => println!("-- connection lost, retrying"),
    }
}

/// Print confirmed messages not printed before. Our own pending sends are
/// shown once the server confirms them.
fn print_new(view: &ChatView<ApiClient>, me: UserId, shown: &mut HashSet<MessageId>) {
    for entry in view.messages() {
        if entry.is_pending() || !shown.insert(entry.message.id) {
            continue;
        }
        println!("{}", render(entry, me));
    }
}

fn render(entry: &CachedMessage, me: UserId) -> String {
    let message = &entry.message;
    let who = if message.sender_id == me {
        "you".to_string()
    } else {
        message.sender_id.to_string()
    };
    let mut line = format!(
        "[{}] {} {}: {}",
        message.id,
        message.timestamp.format("%H:%M"),
        who,
        message.body
    );
    if !message.reactions.is_empty() {
        let reactions: Vec<&str> = message.reactions.iter().map(|r| r.reaction.as_str()).collect();
        line.push_str(&format!(" ({})", reactions.join(" ")));
    }
    match &entry.delivery {
        Delivery::Pending { .. } => line.push_str(" …"),
        Delivery::Failed { reason } => line.push_str(&format!(" [failed: {}]", reason)),
        Delivery::Confirmed if message.sender_id == me && message.read_at.is_some() => {
            line.push_str(" [read]")
        }
        Delivery::Confirmed => {}
    }
    line
}

async fn inbox(session: &Session) -> Result<()> {
    let mut sub = session.bus().subscribe();
    let refresher = session.spawn_sidebar_refresher();
    session.wait_connected(CONNECT_TIMEOUT).await?;

    let update = tokio::time::timeout(CONNECT_TIMEOUT, async {
        while let Some(inbound) = sub.recv().await {
            if let Inbound::Event(ServerEvent::UpdateSidebar(update)) = inbound {
                return Some(update);
            }
        }
        None
    })
    .await
    .context("no inbox from the server")?;
    refresher.abort();

    let Some(update) = update else {
        bail!("connection closed before the inbox arrived");
    };
    let mut sidebar = Sidebar::new();
    sidebar.apply(update);

    if sidebar.is_empty() {
        println!("no conversations yet");
    }
    for (username, entry) in sidebar.entries() {
        let unread = badge(entry.notif_count).map(|b| format!(" ({})", b)).unwrap_or_default();
        println!(
            "{:<16} #{:<6} {:<10} {}{}",
            username, entry.user_id, entry.latest_timestamp, entry.message_preview, unread
        );
    }

    match session.relay().refresh_count(CONNECT_TIMEOUT).await {
        Ok(count) => {
            if let Some(total) = badge(count) {
                println!("{} unread", total);
            }
        }
        Err(e) => warn!("unread count unavailable: {}", e),
    }
    Ok(())
}

async fn checklist(
    session: &Session,
    recipe_id: i64,
    action: Option<ChecklistAction>,
) -> Result<()> {
    let mut checklist = session.open_checklist(recipe_id).await?;

    if let Some(ChecklistAction::Toggle { lines }) = action {
        for line in lines {
            let checked = checklist.toggle(&line_key(line))?;
            info!("line {} {}", line, if checked { "checked" } else { "unchecked" });
        }
    }

    for (key, checked) in checklist.items() {
        println!("[{}] {}", if *checked { "x" } else { " " }, key);
    }
    checklist.close().await;
    Ok(())
}

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{ChatClient, ClientEvent, Destination, UploadSource};
use shared::domain::{Message, RoomId, UserId};
use storage::Storage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    /// Local message cache; created on first run.
    #[arg(long, default_value = "sqlite://chat-cache.db")]
    database_url: String,
    /// Sign in with this account. Without it a previously persisted session
    /// is restored.
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Create the account before signing in.
    #[arg(long, default_value_t = false)]
    register: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();

    let storage = Storage::new(&args.database_url).await?;
    let client = ChatClient::new(&args.server_url, storage);

    let profile = match (&args.username, &args.password) {
        (Some(username), Some(password)) => {
            if args.register {
                client.register(username, password).await?;
            }
            client.login(username, password).await?
        }
        (None, None) => match client.hydrate().await? {
            Some(profile) => profile,
            None => bail!("no stored session; pass --username and --password"),
        },
        _ => bail!("--username and --password go together"),
    };
    println!("signed in as {} ({})", profile.username, profile.id);

    spawn_event_printer(&client);
    if let Err(err) = client.connect().await {
        warn!("realtime channel unavailable, cached rooms still work: {err}");
    }

    repl(&client).await
}

fn spawn_event_printer(client: &Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::MessageReceived { message } => print_message(&message),
                ClientEvent::RoomRefreshed { room_id, messages } => {
                    println!("-- {room_id}: {} message(s) --", messages.len());
                    for message in &messages {
                        print_message(message);
                    }
                }
                ClientEvent::ChannelStateChanged(state) => println!("** channel {state:?}"),
                ClientEvent::SystemNotice(text) => println!("** server: {text}"),
                ClientEvent::SessionInvalidated => {
                    println!("** session expired, sign in again");
                }
                ClientEvent::Error(text) => println!("!! {text}"),
            }
        }
    });
}

fn print_message(message: &Message) {
    let sender = message
        .sender_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "?".to_string());
    let body = match &message.content_text {
        Some(text) => text.clone(),
        None => match &message.attachment_id {
            Some(id) => format!("[attachment {id}]"),
            None => "[empty]".to_string(),
        },
    };
    println!(
        "[{}] {} #{}: {}",
        message.created_at.format("%H:%M:%S"),
        sender,
        message.sequence_id,
        body
    );
}

async fn repl(client: &Arc<ChatClient>) -> Result<()> {
    println!("commands: /friends /groups /dm <user_id> /room <room_id> /older /send <file> /quit");
    println!("anything else goes to the open conversation");

    let mut destination: Option<Destination> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(err) = dispatch(client, &mut destination, line).await {
            println!("!! {err:#}");
        }
        if line == "/quit" {
            break;
        }
    }
    client.disconnect().await;
    Ok(())
}

async fn dispatch(
    client: &Arc<ChatClient>,
    destination: &mut Option<Destination>,
    line: &str,
) -> Result<()> {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    match command {
        "/friends" => {
            for friend in client.list_friends().await? {
                println!(
                    "{}  {} [{}]",
                    friend.id,
                    friend.username,
                    friend.status.as_deref().unwrap_or("unknown")
                );
            }
        }
        "/groups" => {
            for group in client.list_groups().await? {
                println!("{}  {} ({} members)", group.id, group.name, group.member_count);
            }
        }
        "/dm" => {
            let friend_id = UserId::from(rest);
            match client.open_friend_room(&friend_id).await? {
                Some(_) => *destination = Some(Destination::Friend(friend_id)),
                None => println!("no conversation with {rest} yet; /room won't help either until they message you"),
            }
        }
        "/room" => {
            let room_id = RoomId::from(rest);
            client.open_room(room_id.clone()).await?;
            *destination = Some(Destination::Group(room_id));
        }
        "/older" => {
            let Some(room_id) = client.inner.lock().await.open_room.clone() else {
                bail!("open a room first");
            };
            client.load_older_history(&room_id).await?;
        }
        "/send" => {
            let Some(destination) = destination.as_ref() else {
                bail!("open a conversation first");
            };
            let source = UploadSource::from_path(rest, "application/octet-stream").await?;
            let outcome = client.upload_and_send(&source, destination).await?;
            println!(
                "uploaded {} ({} new part(s), {} resumed)",
                outcome.attachment.id, outcome.parts_uploaded, outcome.parts_skipped
            );
        }
        "/quit" => {}
        _ if command.starts_with('/') => bail!("unknown command {command}"),
        _ => {
            let Some(destination) = destination.as_ref() else {
                bail!("open a conversation first");
            };
            client.send_text(destination, line).await?;
        }
    }
    Ok(())
}

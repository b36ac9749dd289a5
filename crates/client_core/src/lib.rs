use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Serialize;
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace, warn};

use shared::{
    protocol::{
        ClientFrame, FriendsResponse, GroupsResponse, HistoryResponse, InboundMessageFrame,
        ServerFrame,
    },
    ContentType, FriendSummary, GroupSummary, Message, MessageId, RoomId, UserId, UserProfile,
};
use storage::Storage;
use uuid::Uuid;

pub mod auth;
pub mod upload;

pub use auth::{AuthGateway, Credentials, GatewayError};
pub use upload::{FileIdentity, UploadOutcome, UploadSession, UploadSource, DEFAULT_CHUNK_SIZE};

/// Application-level heartbeat cadence on the realtime channel.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(45);

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A pushed message for the currently open room, already cached.
    MessageReceived { message: Message },
    /// The open room's full cached view changed (open, sync, or older page).
    RoomRefreshed {
        room_id: RoomId,
        messages: Vec<Message>,
    },
    ChannelStateChanged(ChannelState),
    /// A frame the client could not interpret, surfaced verbatim.
    SystemNotice(String),
    /// Credentials were rejected and could not be refreshed; sign in again.
    SessionInvalidated,
    Error(String),
}

/// Where an outbound message or upload announcement is addressed.
#[derive(Debug, Clone)]
pub enum Destination {
    Friend(UserId),
    Group(RoomId),
}

pub struct ChatClientState {
    pub open_room: Option<RoomId>,
    pub friend_rooms: HashMap<UserId, RoomId>,
    pub upload_session: Option<UploadSession>,
    pub channel_state: ChannelState,
    ws_sink: Option<Arc<Mutex<WsSink>>>,
    ws_tasks: Vec<JoinHandle<()>>,
    /// Bumped on every connect and disconnect so a task from a dead
    /// connection can never touch the state of a live one.
    ws_generation: u64,
}

pub struct ChatClient {
    http: Client,
    server_url: String,
    gateway: AuthGateway,
    storage: Storage,
    heartbeat_interval: Duration,
    pub inner: Mutex<ChatClientState>,
    events: broadcast::Sender<ClientEvent>,
}

#[derive(Serialize)]
struct AfterQuery<'a> {
    room_id: &'a str,
    after_sequence_id: i64,
}

#[derive(Serialize)]
struct BeforeQuery<'a> {
    room_id: &'a str,
    message_id: &'a str,
}

#[derive(Serialize)]
struct LatestByFriendQuery<'a> {
    friend_id: &'a str,
}

impl ChatClient {
    pub fn new(server_url: impl Into<String>, storage: Storage) -> Arc<Self> {
        Self::new_with_heartbeat_interval(server_url, storage, HEARTBEAT_INTERVAL)
    }

    pub fn new_with_heartbeat_interval(
        server_url: impl Into<String>,
        storage: Storage,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let http = Client::new();
        let server_url = server_url.into().trim_end_matches('/').to_string();
        let gateway = AuthGateway::new(
            http.clone(),
            server_url.clone(),
            storage.clone(),
            events.clone(),
        );
        Arc::new(Self {
            http,
            server_url,
            gateway,
            storage,
            heartbeat_interval,
            inner: Mutex::new(ChatClientState {
                open_room: None,
                friend_rooms: HashMap::new(),
                upload_session: None,
                channel_state: ChannelState::Disconnected,
                ws_sink: None,
                ws_tasks: Vec::new(),
                ws_generation: 0,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn gateway(&self) -> &AuthGateway {
        &self.gateway
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    // -- session ------------------------------------------------------------

    pub async fn hydrate(&self) -> Result<Option<UserProfile>> {
        Ok(self.gateway.hydrate().await?)
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<UserProfile> {
        Ok(self.gateway.register(username, password).await?)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile> {
        Ok(self.gateway.login(username, password).await?)
    }

    pub async fn logout(&self) -> Result<()> {
        self.disconnect().await;
        self.gateway.logout().await?;
        let mut guard = self.inner.lock().await;
        guard.open_room = None;
        guard.friend_rooms.clear();
        guard.upload_session = None;
        Ok(())
    }

    // -- room directory -----------------------------------------------------

    /// Friends are a room-id source: each friend with message history carries
    /// the shared direct room. The mapping is remembered for send routing.
    pub async fn list_friends(&self) -> Result<Vec<FriendSummary>> {
        let response = self
            .gateway
            .send(|http| http.get(format!("{}/api/friends/list", self.server_url)))
            .await?
            .error_for_status()?;
        let body: FriendsResponse = response.json().await?;

        let mut guard = self.inner.lock().await;
        for friend in &body.friends {
            if !friend.room_id.is_empty() {
                guard
                    .friend_rooms
                    .insert(friend.id.clone(), friend.room_id.clone());
            }
        }
        Ok(body.friends)
    }

    pub async fn list_groups(&self) -> Result<Vec<GroupSummary>> {
        let response = self
            .gateway
            .send(|http| http.get(format!("{}/api/groups/my", self.server_url)))
            .await?
            .error_for_status()?;
        let body: GroupsResponse = response.json().await?;
        Ok(body.groups)
    }

    // -- sync reconciler ----------------------------------------------------

    /// Opens a room local-first: render what the cache holds, pull everything
    /// past the cache watermark, then re-render if the pull changed anything.
    pub async fn open_room(&self, room_id: RoomId) -> Result<Vec<Message>> {
        {
            let mut guard = self.inner.lock().await;
            guard.open_room = Some(room_id.clone());
        }

        let cached = self.storage.messages_in_room(&room_id).await?;
        self.emit(ClientEvent::RoomRefreshed {
            room_id: room_id.clone(),
            messages: cached.clone(),
        });

        match self.sync_room(&room_id).await {
            Ok(0) => Ok(cached),
            Ok(pulled) => {
                debug!(room_id = %room_id, pulled, "sync pulled new messages");
                let refreshed = self.storage.messages_in_room(&room_id).await?;
                self.emit(ClientEvent::RoomRefreshed {
                    room_id,
                    messages: refreshed.clone(),
                });
                Ok(refreshed)
            }
            Err(err) => {
                // Offline or failing server: the cached view stays usable.
                warn!(room_id = %room_id, "sync failed, rendering cache only: {err}");
                self.emit(ClientEvent::Error(format!("sync failed: {err}")));
                Ok(cached)
            }
        }
    }

    /// Pulls messages with `sequence_id` above the cache watermark and
    /// upserts them. Returns how many rows the server sent.
    pub async fn sync_room(&self, room_id: &RoomId) -> Result<usize> {
        let watermark = self.storage.last_sequence_id(room_id).await?;
        let response = self
            .gateway
            .send(|http| {
                http.get(format!("{}/api/messages/history/after", self.server_url))
                    .query(&AfterQuery {
                        room_id: room_id.as_str(),
                        after_sequence_id: watermark,
                    })
            })
            .await?
            .error_for_status()?;
        let body: HistoryResponse = response.json().await?;
        let pulled = body.messages.len();
        self.storage.bulk_upsert_messages(&body.messages).await?;
        Ok(pulled)
    }

    /// Opens the direct room shared with a friend. When no room is known yet
    /// the latest-history endpoint seeds the cache and reveals the room id;
    /// a friend with no message history has no room to open.
    pub async fn open_friend_room(&self, friend_id: &UserId) -> Result<Option<RoomId>> {
        let known = {
            let guard = self.inner.lock().await;
            guard.friend_rooms.get(friend_id).cloned()
        };
        if let Some(room_id) = known {
            self.open_room(room_id.clone()).await?;
            return Ok(Some(room_id));
        }

        let response = self
            .gateway
            .send(|http| {
                http.get(format!("{}/api/messages/history/latest", self.server_url))
                    .query(&LatestByFriendQuery {
                        friend_id: friend_id.as_str(),
                    })
            })
            .await?
            .error_for_status()?;
        let body: HistoryResponse = response.json().await?;

        let Some(first) = body.messages.first() else {
            return Ok(None);
        };
        let room_id = first.room_id.clone();
        self.storage.bulk_upsert_messages(&body.messages).await?;
        {
            let mut guard = self.inner.lock().await;
            guard
                .friend_rooms
                .insert(friend_id.clone(), room_id.clone());
        }
        self.open_room(room_id.clone()).await?;
        Ok(Some(room_id))
    }

    /// Pages history older than the oldest cached message into the cache and
    /// re-renders. A room with nothing cached has no paging anchor.
    pub async fn load_older_history(&self, room_id: &RoomId) -> Result<Vec<Message>> {
        let cached = self.storage.messages_in_room(room_id).await?;
        let Some(oldest) = cached.first() else {
            return Ok(cached);
        };

        let response = self
            .gateway
            .send(|http| {
                http.get(format!("{}/api/messages/history/before", self.server_url))
                    .query(&BeforeQuery {
                        room_id: room_id.as_str(),
                        message_id: oldest.id.as_str(),
                    })
            })
            .await?
            .error_for_status()?;
        let body: HistoryResponse = response.json().await?;
        if body.messages.is_empty() {
            self.emit(ClientEvent::SystemNotice("no more history".to_string()));
            return Ok(cached);
        }

        self.storage.bulk_upsert_messages(&body.messages).await?;
        let merged = self.storage.messages_in_room(room_id).await?;
        self.emit(ClientEvent::RoomRefreshed {
            room_id: room_id.clone(),
            messages: merged.clone(),
        });
        Ok(merged)
    }

    // -- realtime channel ---------------------------------------------------

    /// Dials the websocket with the current access token, then spawns the
    /// heartbeat and reader tasks. There is no automatic reconnect; the
    /// caller decides when to dial again after `Disconnected`.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let token = self.gateway.access_token().await?;
        {
            let mut guard = self.inner.lock().await;
            if guard.channel_state != ChannelState::Disconnected {
                debug!("realtime channel already active, ignoring connect");
                return Ok(());
            }
            guard.channel_state = ChannelState::Connecting;
        }
        self.emit(ClientEvent::ChannelStateChanged(ChannelState::Connecting));

        let ws_url = match websocket_url(&self.server_url) {
            Ok(base) => format!("{base}/ws?token={token}"),
            Err(err) => {
                self.reset_channel().await;
                return Err(err);
            }
        };
        let (ws_stream, _) = match connect_async(&ws_url).await {
            Ok(pair) => pair,
            Err(err) => {
                self.reset_channel().await;
                return Err(anyhow!(err)).context("failed to connect websocket");
            }
        };
        let (writer, mut reader) = ws_stream.split();
        let writer = Arc::new(Mutex::new(writer));

        // Install the transport before the reader task exists, so a server
        // that hangs up immediately tears down state that is already there
        // instead of being overwritten by a half-finished connect.
        let (generation, open_room) = {
            let mut guard = self.inner.lock().await;
            guard.ws_generation += 1;
            guard.ws_sink = Some(Arc::clone(&writer));
            guard.channel_state = ChannelState::Connected;
            (guard.ws_generation, guard.open_room.clone())
        };
        self.emit(ClientEvent::ChannelStateChanged(ChannelState::Connected));

        let heartbeat = {
            let writer = Arc::clone(&writer);
            let interval = self.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let frame = match serde_json::to_string(&ClientFrame::Ping) {
                        Ok(frame) => frame,
                        Err(_) => break,
                    };
                    let mut sink = writer.lock().await;
                    if sink.send(WsMessage::Text(frame)).await.is_err() {
                        break;
                    }
                }
            })
        };

        // Abort from both exit paths: explicit disconnect (the handle lives in
        // ws_tasks) and reader exit on close or error.
        let heartbeat_abort = heartbeat.abort_handle();
        let reader_task = {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(frame) = reader.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => client.handle_frame(&text).await,
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            client.emit(ClientEvent::Error(format!(
                                "websocket receive failed: {err}"
                            )));
                            break;
                        }
                    }
                }
                heartbeat_abort.abort();
                let mut guard = client.inner.lock().await;
                // A newer connection owns the channel state by now.
                if guard.ws_generation != generation {
                    return;
                }
                guard.ws_sink = None;
                guard.ws_tasks.clear();
                if guard.channel_state != ChannelState::Disconnected {
                    guard.channel_state = ChannelState::Disconnected;
                    drop(guard);
                    client.emit(ClientEvent::ChannelStateChanged(ChannelState::Disconnected));
                }
            })
        };

        {
            let mut guard = self.inner.lock().await;
            if guard.ws_generation == generation
                && guard.channel_state == ChannelState::Connected
            {
                guard.ws_tasks.push(heartbeat);
                guard.ws_tasks.push(reader_task);
            } else {
                // The channel was torn down while the tasks were spawning.
                drop(guard);
                heartbeat.abort();
                reader_task.abort();
            }
        }

        // Anything pushed while the channel was down is only on the server;
        // pull the open room back level.
        if let Some(room_id) = open_room {
            if let Err(err) = self.resync_open_room(&room_id).await {
                self.emit(ClientEvent::Error(format!("post-connect sync failed: {err}")));
            }
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        let (tasks, was_connected) = {
            let mut guard = self.inner.lock().await;
            guard.ws_generation += 1;
            let tasks = std::mem::take(&mut guard.ws_tasks);
            guard.ws_sink = None;
            let was_connected = guard.channel_state != ChannelState::Disconnected;
            guard.channel_state = ChannelState::Disconnected;
            (tasks, was_connected)
        };
        for task in tasks {
            task.abort();
        }
        if was_connected {
            self.emit(ClientEvent::ChannelStateChanged(ChannelState::Disconnected));
        }
    }

    pub async fn channel_state(&self) -> ChannelState {
        self.inner.lock().await.channel_state
    }

    async fn reset_channel(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.channel_state = ChannelState::Disconnected;
            guard.ws_sink = None;
        }
        self.emit(ClientEvent::ChannelStateChanged(ChannelState::Disconnected));
    }

    async fn resync_open_room(&self, room_id: &RoomId) -> Result<()> {
        if self.sync_room(room_id).await? > 0 {
            let messages = self.storage.messages_in_room(room_id).await?;
            self.emit(ClientEvent::RoomRefreshed {
                room_id: room_id.clone(),
                messages,
            });
        }
        Ok(())
    }

    /// Every message frame is cached before anything is rendered, so a crash
    /// between the two never loses a delivered message. Only frames for the
    /// open room surface as `MessageReceived`.
    async fn handle_frame(self: &Arc<Self>, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(_) => {
                self.emit(ClientEvent::SystemNotice(text.trim().to_string()));
                return;
            }
        };

        let (content_type, inbound) = match frame {
            ServerFrame::Ping { .. } => {
                let pong = ClientFrame::Pong {
                    ts: Utc::now().timestamp(),
                };
                if let Err(err) = self.send_frame(&pong).await {
                    debug!("pong reply failed: {err}");
                }
                return;
            }
            ServerFrame::Pong { ts } => {
                trace!(ts, "heartbeat pong");
                return;
            }
            ServerFrame::FriendMessage(inner) => (ContentType::Text, inner),
            ServerFrame::GroupMessage(inner) => (ContentType::Text, inner),
            ServerFrame::FileMessage(inner) | ServerFrame::ImageMessage(inner) => {
                (ContentType::File, inner)
            }
        };

        self.record_friend_room(&inbound).await;

        let Some(message) = message_from_frame(content_type, inbound) else {
            self.emit(ClientEvent::SystemNotice(text.trim().to_string()));
            return;
        };

        if let Err(err) = self.storage.upsert_message(&message).await {
            self.emit(ClientEvent::Error(format!(
                "failed to cache pushed message: {err}"
            )));
            return;
        }

        let open_room = { self.inner.lock().await.open_room.clone() };
        if open_room.as_ref() == Some(&message.room_id) {
            self.emit(ClientEvent::MessageReceived { message });
        }
    }

    /// Direct-message frames reveal the shared room id; remember it so the
    /// next send to that friend can route without a directory refresh.
    async fn record_friend_room(&self, inbound: &InboundMessageFrame) {
        let Some(room_id) = inbound.room_id.clone() else {
            return;
        };
        let Some(to_user_id) = inbound.to_user_id.clone() else {
            return;
        };
        let me = self
            .gateway
            .current_user()
            .await
            .map(|(user_id, _)| user_id);
        let friend = if me.as_ref() == Some(&inbound.from_user_id) {
            to_user_id
        } else {
            inbound.from_user_id.clone()
        };
        let mut guard = self.inner.lock().await;
        guard.friend_rooms.insert(friend, room_id);
    }

    // -- outbound -----------------------------------------------------------

    pub async fn send_text(&self, destination: &Destination, content: &str) -> Result<()> {
        // The server drops content-free frames without a word; fail here
        // instead of losing the message silently.
        if content.trim().is_empty() {
            return Err(anyhow!("message content is empty"));
        }
        let frame = match destination {
            Destination::Friend(user_id) => ClientFrame::FriendMessage {
                to_user_id: user_id.clone(),
                content: content.to_string(),
            },
            Destination::Group(room_id) => ClientFrame::GroupMessage {
                room_id: room_id.clone(),
                content: content.to_string(),
            },
        };
        self.send_frame(&frame).await
    }

    pub(crate) async fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let sink = {
            let guard = self.inner.lock().await;
            guard
                .ws_sink
                .clone()
                .ok_or_else(|| anyhow!("realtime channel not connected"))?
        };
        let text = serde_json::to_string(frame)?;
        let mut sink = sink.lock().await;
        sink.send(WsMessage::Text(text))
            .await
            .context("failed to send websocket frame")?;
        Ok(())
    }
}

fn websocket_url(server_url: &str) -> Result<String> {
    if let Some(rest) = server_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(anyhow!("server_url must start with http:// or https://"))
    }
}

fn message_from_frame(content_type: ContentType, frame: InboundMessageFrame) -> Option<Message> {
    let room_id = frame.room_id?;
    let created_at = DateTime::from_timestamp(frame.timestamp, 0)?;
    let payload_json = frame
        .attachment
        .as_ref()
        .and_then(|attachment| serde_json::to_value(attachment).ok());
    // A frame without an id gets a placeholder; the authoritative copy pulled
    // later carries its own id and supersedes nothing.
    let id = frame
        .id
        .unwrap_or_else(|| MessageId::from(format!("local-{}", Uuid::new_v4())));
    Some(Message {
        id,
        room_id,
        sequence_id: frame.sequence_id,
        sender_id: Some(frame.from_user_id),
        content_type,
        content_text: frame.content,
        attachment_id: frame.attachment_id,
        payload_json,
        created_at,
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod auth_tests;

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod upload_tests;

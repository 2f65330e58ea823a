//! One open conversation: cache, typing state and alerts wired to the bus.

use std::collections::HashSet;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use pantry_types::events::{ChatTarget, ClientCommand, OutgoingMessage, Presence, ServerEvent};
use pantry_types::models::{MessageId, UserId};

use crate::api::MessageSource;
use crate::bus::{EventBus, Subscription};
use crate::config::ClientConfig;
use crate::conversation::{CachedMessage, ConversationCache, LiveOutcome};
use crate::error::{ClientError, Result};
use crate::notify::NotificationRelay;
use crate::transport::Inbound;
use crate::typing::{TypingDebouncer, TypingIndicator};

/// Something the front end may want to redraw for.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    /// The message list changed
    Messages,
    Confirmed(Uuid),
    SendFailed { client_id: Uuid, reason: String },
    PeerTyping(bool),
    PeerPresence(Presence),
    /// The server rejected something without naming a send
    ServerError(String),
    Reconnected,
    Disconnected,
}

pub struct ChatView<S> {
    with: UserId,
    bus: EventBus,
    source: S,
    relay: NotificationRelay,
    sub: Subscription,
    cache: ConversationCache,
    peer_typing: TypingIndicator,
    typing: TypingDebouncer,
    cancel: CancellationToken,
}

impl<S: MessageSource> ChatView<S> {
    /// Announce the chat, load its newest page and acknowledge it.
    pub async fn open(
        me: UserId,
        with: UserId,
        bus: EventBus,
        source: S,
        relay: NotificationRelay,
        config: &ClientConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let cancel = parent.child_token();
        // Subscribe first so nothing pushed during the load is lost
        let sub = bus.subscribe();
        // Refresh well inside the peer's expiry window
        let typing = TypingDebouncer::spawn(
            bus.clone(),
            with,
            config.typing_quiet,
            config.typing_expiry / 2,
            &cancel,
        );

        let mut view = Self {
            with,
            bus,
            source,
            relay,
            sub,
            cache: ConversationCache::new(me, with, config.send_timeout),
            peer_typing: TypingIndicator::new(config.typing_expiry),
            typing,
            cancel,
        };

        view.relay.ensure_permission();
        view.announce();
        view.cache.load_initial(&view.source).await?;
        view.acknowledge();
        Ok(view)
    }

    pub fn with(&self) -> UserId {
        self.with
    }

    pub fn messages(&self) -> &[CachedMessage] {
        self.cache.messages()
    }

    pub fn search(&self, term: &str) -> Vec<&CachedMessage> {
        self.cache.search(term)
    }

    pub fn has_more(&self) -> bool {
        self.cache.has_more()
    }

    pub fn peer_typing(&self) -> bool {
        self.peer_typing.is_typing(self.with)
    }

    pub async fn load_more(&mut self) -> Result<usize> {
        self.cache.load_more(&self.source).await
    }

    /// Local input changed.
    pub fn keystroke(&self) {
        self.typing.keystroke();
    }

    /// Optimistically add the message and emit it. If the emit fails the
    /// entry is rolled back before returning the error.
    pub fn send(&mut self, body: &str) -> Result<Uuid> {
        let client_id = self.cache.insert_pending(body)?;
        self.typing.stop();

        let cmd = ClientCommand::MessageInput {
            data: OutgoingMessage {
                message: body.trim().to_string(),
                recipient_id: self.with,
                client_id,
            },
        };
        if let Err(e) = self.bus.emit(cmd) {
            let reason = e.to_string();
            self.cache.fail_pending(client_id, &reason);
            warn!("message to {} not sent: {}", self.with, reason);
            return Err(ClientError::SendFailed { client_id, reason });
        }
        Ok(client_id)
    }

    pub fn react(&self, message_id: MessageId, reaction: &str) -> Result<()> {
        self.bus.emit(ClientCommand::MessageReaction {
            message_id,
            reaction: reaction.to_string(),
        })
    }

    /// Wait for the next batch of changes: inbound events, overdue sends or
    /// a lapsed typing flag. `None` once the view is closed or the channel
    /// is gone.
    pub async fn next_update(&mut self) -> Option<Vec<ChatUpdate>> {
        loop {
            let send_deadline = self.cache.next_deadline();
            let typing_deadline = self.peer_typing.expires_at(self.with);

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                inbound = self.sub.recv() => {
                    let updates = self.apply(inbound?);
                    if !updates.is_empty() {
                        return Some(updates);
                    }
                }
                _ = sleep_until(send_deadline) => {
                    let updates: Vec<ChatUpdate> = self
                        .cache
                        .expire_pending(Instant::now())
                        .into_iter()
                        .filter_map(|entry| {
                            let client_id = entry.message.client_id?;
                            warn!("message {} timed out", client_id);
                            Some(ChatUpdate::SendFailed {
                                client_id,
                                reason: "no confirmation from server".into(),
                            })
                        })
                        .collect();
                    if !updates.is_empty() {
                        return Some(updates);
                    }
                }
                _ = sleep_until(typing_deadline) => {
                    if self.peer_typing.prune().contains(&self.with) {
                        return Some(vec![ChatUpdate::PeerTyping(false)]);
                    }
                }
            }
        }
    }

    /// Apply one inbound item to the view.
    pub fn apply(&mut self, inbound: Inbound) -> Vec<ChatUpdate> {
        let event = match inbound {
            Inbound::Connected => {
                // Rejoin; the server answers with the newest page
                self.announce();
                return vec![ChatUpdate::Reconnected];
            }
            Inbound::Disconnected => {
                self.peer_typing.clear();
                return vec![ChatUpdate::Disconnected];
            }
            Inbound::Event(event) => event,
        };

        match event {
            ServerEvent::NewMessage(message) => {
                let from_peer = message.sender_id == self.with;
                match self.cache.apply_live(message.clone()) {
                    LiveOutcome::Appended => {
                        if from_peer {
                            self.relay.message_arrived(&message);
                            self.peer_typing.apply(self.with, false);
                            self.acknowledge();
                        }
                        vec![ChatUpdate::Messages]
                    }
                    LiveOutcome::Confirmed(client_id) => {
                        vec![ChatUpdate::Confirmed(client_id), ChatUpdate::Messages]
                    }
                    LiveOutcome::Ignored => Vec::new(),
                }
            }
            ServerEvent::LoadMessages(loaded) => {
                if let Some(recipient) = &loaded.chat_recipient {
                    if recipient.id != self.with {
                        return Vec::new();
                    }
                }
                let known: HashSet<MessageId> = self
                    .cache
                    .messages()
                    .iter()
                    .map(|entry| entry.message.id)
                    .collect();
                let fresh_from_peer: Vec<_> = loaded
                    .page
                    .messages
                    .iter()
                    .filter(|m| m.sender_id == self.with && !known.contains(&m.id))
                    .cloned()
                    .collect();

                let confirmed = self.cache.merge_newest(loaded.page);
                let mut updates: Vec<ChatUpdate> =
                    confirmed.into_iter().map(ChatUpdate::Confirmed).collect();
                updates.push(ChatUpdate::Messages);

                if !fresh_from_peer.is_empty() {
                    for message in &fresh_from_peer {
                        self.relay.message_arrived(message);
                    }
                    self.peer_typing.apply(self.with, false);
                    self.acknowledge();
                }
                updates
            }
            ServerEvent::UserTyping { user_id, is_typing } if user_id == self.with => {
                let was = self.peer_typing.is_typing(self.with);
                self.peer_typing.apply(user_id, is_typing);
                if was == is_typing {
                    Vec::new()
                } else {
                    vec![ChatUpdate::PeerTyping(is_typing)]
                }
            }
            ServerEvent::MessageReaction {
                message_id,
                reaction,
                user_id,
            } => {
                if self.cache.apply_reaction(message_id, &reaction, user_id) {
                    vec![ChatUpdate::Messages]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::MessageStatusUpdate {
                message_id,
                status,
                timestamp,
            } => {
                if self.cache.apply_receipt(message_id, status, timestamp) {
                    vec![ChatUpdate::Messages]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::UserStatus { user_id, status } if user_id == self.with => {
                vec![ChatUpdate::PeerPresence(status)]
            }
            ServerEvent::Error {
                message,
                client_id: Some(client_id),
            } => match self.cache.fail_pending(client_id, &message) {
                Some(_) => vec![ChatUpdate::SendFailed {
                    client_id,
                    reason: message,
                }],
                None => Vec::new(),
            },
            ServerEvent::Error {
                message,
                client_id: None,
            } => vec![ChatUpdate::ServerError(message)],
            _ => Vec::new(),
        }
    }

    /// Stop background work. Pending state is dropped with the view.
    pub fn close(self) {
        self.cancel.cancel();
        debug!("chat with {} closed", self.with);
    }

    fn announce(&self) {
        let cmd = ClientCommand::ChatUserConnected {
            data: ChatTarget { recipient: self.with },
        };
        if let Err(e) = self.bus.emit(cmd) {
            debug!("chat announce skipped: {}", e);
        }
    }

    /// Tell the server the open chat has been seen, clearing its unread
    /// count.
    fn acknowledge(&self) {
        let cmd = ClientCommand::MessagesLoaded {
            data: ChatTarget { recipient: self.with },
        };
        if let Err(e) = self.bus.emit(cmd) {
            debug!("messages_loaded skipped: {}", e);
        }
    }
}

impl<S> Drop for ChatView<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

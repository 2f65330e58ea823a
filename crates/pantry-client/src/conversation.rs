//! In-memory view of one conversation.
//!
//! Messages are kept oldest to newest. History arrives from the server in
//! pages (newest page first, each page newest-first) and is prepended as the
//! user scrolls back; live messages are appended. Locally sent messages sit
//! in the list as `Pending` until the server echoes them back.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use pantry_types::api::MessagePage;
use pantry_types::events::ReceiptKind;
use pantry_types::models::{MAX_BODY_CHARS, Message, MessageId, Reaction, UserId};

use crate::api::MessageSource;
use crate::error::{ClientError, Result};

/// Delivery state of a cached message. Everything that came from the server
/// is `Confirmed`.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Pending { client_id: Uuid },
    Confirmed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedMessage {
    pub message: Message,
    pub delivery: Delivery,
}

impl CachedMessage {
    pub fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending { .. })
    }
}

/// What a live message did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    Appended,
    /// Replaced the pending entry with this client id
    Confirmed(Uuid),
    /// Duplicate, stale or for another conversation
    Ignored,
}

pub struct ConversationCache {
    me: UserId,
    with: UserId,
    messages: Vec<CachedMessage>,
    /// Ids of server messages present in `messages`
    ids: HashSet<MessageId>,
    /// Highest sequence number seen from the server
    watermark: Option<u64>,
    next_page: Option<u32>,
    has_next: bool,
    loaded: bool,
    /// Send deadline per pending client id
    pending: HashMap<Uuid, Instant>,
    send_timeout: Duration,
}

impl ConversationCache {
    pub fn new(me: UserId, with: UserId, send_timeout: Duration) -> Self {
        Self {
            me,
            with,
            messages: Vec::new(),
            ids: HashSet::new(),
            watermark: None,
            next_page: None,
            has_next: false,
            loaded: false,
            pending: HashMap::new(),
            send_timeout,
        }
    }

    pub fn with(&self) -> UserId {
        self.with
    }

    pub fn messages(&self) -> &[CachedMessage] {
        &self.messages
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether `load_more` can fetch anything.
    pub fn has_more(&self) -> bool {
        self.loaded && self.has_next && self.next_page.is_some()
    }

    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// Fetch the newest page, replacing everything except pending sends.
    pub async fn load_initial<S: MessageSource>(&mut self, source: &S) -> Result<()> {
        let page = source.fetch_page(self.with, 1).await?;
        debug!(
            "loaded {} newest messages with {}",
            page.messages.len(),
            self.with
        );

        let pending: Vec<CachedMessage> = self
            .messages
            .drain(..)
            .filter(CachedMessage::is_pending)
            .collect();
        self.ids.clear();
        self.prepend_page(page);
        self.messages.extend(pending);
        self.loaded = true;
        Ok(())
    }

    /// Fetch the next older page and prepend it. Returns how many messages
    /// were added; zero once the server has reported the last page.
    pub async fn load_more<S: MessageSource>(&mut self, source: &S) -> Result<usize> {
        if !self.has_more() {
            return Ok(0);
        }
        let Some(page_no) = self.next_page else {
            return Ok(0);
        };
        let page = source.fetch_page(self.with, page_no).await?;
        let added = self.prepend_page(page);
        debug!("page {} with {} added {} messages", page_no, self.with, added);
        Ok(added)
    }

    /// Put a server page (newest-first) in front of what is cached.
    fn prepend_page(&mut self, page: MessagePage) -> usize {
        self.has_next = page.has_next;
        self.next_page = if page.has_next { page.next_page } else { None };

        let mut older = Vec::with_capacity(page.messages.len());
        for message in page.messages.into_iter().rev() {
            if !self.belongs_here(&message) || !self.ids.insert(message.id) {
                continue;
            }
            self.raise_watermark(message.seq);
            older.push(CachedMessage {
                message,
                delivery: Delivery::Confirmed,
            });
        }

        let added = older.len();
        older.append(&mut self.messages);
        self.messages = older;
        added
    }

    /// A single pushed message. Appended unless it echoes one of our pending
    /// sends, repeats a known id or carries a sequence number at or below
    /// the watermark.
    pub fn apply_live(&mut self, message: Message) -> LiveOutcome {
        if !self.belongs_here(&message) {
            return LiveOutcome::Ignored;
        }
        if let Some(client_id) = self.confirm_echo(&message) {
            return LiveOutcome::Confirmed(client_id);
        }
        if let (Some(seq), Some(watermark)) = (message.seq, self.watermark) {
            if seq <= watermark {
                trace!("dropping stale message seq {} <= {}", seq, watermark);
                return LiveOutcome::Ignored;
            }
        }
        if !self.ids.insert(message.id) {
            trace!("dropping duplicate message {}", message.id);
            return LiveOutcome::Ignored;
        }

        self.raise_watermark(message.seq);
        self.messages.push(CachedMessage {
            message,
            delivery: Delivery::Confirmed,
        });
        LiveOutcome::Appended
    }

    /// Merge the newest page the server pushes after a send or chat switch.
    /// Known ids are refreshed in place, unknown ones appended in order.
    /// Returns the client ids of pending sends it confirmed.
    pub fn merge_newest(&mut self, page: MessagePage) -> Vec<Uuid> {
        if !self.loaded {
            self.has_next = page.has_next;
            self.next_page = if page.has_next { page.next_page } else { None };
            self.loaded = true;
        }

        let mut confirmed = Vec::new();
        for message in page.messages.into_iter().rev() {
            if !self.belongs_here(&message) {
                continue;
            }
            if let Some(client_id) = self.confirm_echo(&message) {
                confirmed.push(client_id);
                continue;
            }
            if self.ids.contains(&message.id) {
                self.refresh_known(message);
                continue;
            }
            self.ids.insert(message.id);
            self.raise_watermark(message.seq);
            self.insert_before_pending(CachedMessage {
                message,
                delivery: Delivery::Confirmed,
            });
        }
        confirmed
    }

    /// Optimistically add a message we are about to send.
    pub fn insert_pending(&mut self, body: &str) -> Result<Uuid> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ClientError::InvalidMessage("message is empty".into()));
        }
        let chars = body.chars().count();
        if chars > MAX_BODY_CHARS {
            return Err(ClientError::InvalidMessage(format!(
                "message is {} characters, limit is {}",
                chars, MAX_BODY_CHARS
            )));
        }

        let client_id = Uuid::new_v4();
        let message = Message {
            id: MessageId(0),
            sender_id: self.me,
            recipient_id: self.with,
            body: body.to_string(),
            timestamp: Utc::now(),
            delivered_at: None,
            read_at: None,
            reactions: Vec::new(),
            seq: None,
            client_id: Some(client_id),
        };
        self.messages.push(CachedMessage {
            message,
            delivery: Delivery::Pending { client_id },
        });
        self.pending
            .insert(client_id, Instant::now() + self.send_timeout);
        Ok(client_id)
    }

    /// Roll back a pending send. Returns the removed entry marked `Failed`.
    pub fn fail_pending(&mut self, client_id: Uuid, reason: &str) -> Option<CachedMessage> {
        self.pending.remove(&client_id)?;
        let idx = self.position_of_pending(client_id)?;
        let mut entry = self.messages.remove(idx);
        entry.delivery = Delivery::Failed {
            reason: reason.to_string(),
        };
        debug!("send {} rolled back: {}", client_id, reason);
        Some(entry)
    }

    /// Roll back every pending send whose echo is overdue at `now`.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<CachedMessage> {
        let overdue: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(client_id, _)| *client_id)
            .collect();
        overdue
            .into_iter()
            .filter_map(|client_id| self.fail_pending(client_id, "no confirmation from server"))
            .collect()
    }

    /// Earliest deadline among pending sends.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Reactions only ever grow; a repeat of the same reaction by the same
    /// user is ignored.
    pub fn apply_reaction(&mut self, message_id: MessageId, reaction: &str, user_id: UserId) -> bool {
        let Some(entry) = self.find_mut(message_id) else {
            return false;
        };
        let reactions = &mut entry.message.reactions;
        if reactions
            .iter()
            .any(|r| r.user_id == user_id && r.reaction == reaction)
        {
            return false;
        }
        reactions.push(Reaction {
            reaction: reaction.to_string(),
            user_id,
        });
        true
    }

    /// Receipts are set once; later receipts for the same kind are ignored.
    pub fn apply_receipt(
        &mut self,
        message_id: MessageId,
        kind: ReceiptKind,
        at: Option<DateTime<Utc>>,
    ) -> bool {
        let Some(entry) = self.find_mut(message_id) else {
            return false;
        };
        let at = at.unwrap_or_else(Utc::now);
        let slot = match kind {
            ReceiptKind::Delivered => &mut entry.message.delivered_at,
            ReceiptKind::Read => &mut entry.message.read_at,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        // Read implies delivered
        if kind == ReceiptKind::Read && entry.message.delivered_at.is_none() {
            entry.message.delivered_at = Some(at);
        }
        true
    }

    /// Case-insensitive substring filter over bodies, oldest first.
    pub fn search(&self, term: &str) -> Vec<&CachedMessage> {
        let needle = term.trim().to_lowercase();
        self.messages
            .iter()
            .filter(|entry| needle.is_empty() || entry.message.body.to_lowercase().contains(&needle))
            .collect()
    }

    /// Messages from the other participant we have not marked read yet.
    pub fn unread_from_peer(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|entry| {
                entry.message.sender_id == self.with && entry.message.read_at.is_none()
            })
            .map(|entry| entry.message.id)
            .collect()
    }

    fn belongs_here(&self, message: &Message) -> bool {
        let involves_me = message.sender_id == self.me || message.recipient_id == self.me;
        involves_me && message.conversation_with(self.me) == self.with
    }

    fn raise_watermark(&mut self, seq: Option<u64>) {
        if let Some(seq) = seq {
            self.watermark = Some(self.watermark.map_or(seq, |w| w.max(seq)));
        }
    }

    /// If `message` is the server copy of one of our pending sends, swap it
    /// in. Servers that do not echo `client_id` are matched on the oldest
    /// pending entry with the same body.
    fn confirm_echo(&mut self, message: &Message) -> Option<Uuid> {
        if message.sender_id != self.me || self.pending.is_empty() {
            return None;
        }
        let client_id = match message.client_id {
            Some(client_id) if self.pending.contains_key(&client_id) => client_id,
            Some(_) => return None,
            None => {
                if self.ids.contains(&message.id) {
                    return None;
                }
                self.messages.iter().find_map(|entry| match entry.delivery {
                    Delivery::Pending { client_id } if entry.message.body == message.body => {
                        Some(client_id)
                    }
                    _ => None,
                })?
            }
        };

        let idx = self.position_of_pending(client_id)?;
        self.pending.remove(&client_id);
        self.ids.insert(message.id);
        self.raise_watermark(message.seq);
        self.messages[idx] = CachedMessage {
            message: message.clone(),
            delivery: Delivery::Confirmed,
        };
        debug!("send {} confirmed as message {}", client_id, message.id);
        Some(client_id)
    }

    /// Take over set-once receipts and new reactions from a fresh server
    /// copy; nothing already known is cleared.
    fn refresh_known(&mut self, fresh: Message) {
        let Some(entry) = self.find_mut(fresh.id) else {
            return;
        };
        let cached = &mut entry.message;
        if cached.delivered_at.is_none() {
            cached.delivered_at = fresh.delivered_at;
        }
        if cached.read_at.is_none() {
            cached.read_at = fresh.read_at;
        }
        for reaction in fresh.reactions {
            if !cached.reactions.contains(&reaction) {
                cached.reactions.push(reaction);
            }
        }
    }

    fn insert_before_pending(&mut self, entry: CachedMessage) {
        let idx = self
            .messages
            .iter()
            .position(CachedMessage::is_pending)
            .unwrap_or(self.messages.len());
        self.messages.insert(idx, entry);
    }

    fn position_of_pending(&self, client_id: Uuid) -> Option<usize> {
        self.messages.iter().position(|entry| {
            matches!(entry.delivery, Delivery::Pending { client_id: id } if id == client_id)
        })
    }

    fn find_mut(&mut self, message_id: MessageId) -> Option<&mut CachedMessage> {
        if !self.ids.contains(&message_id) {
            return None;
        }
        self.messages
            .iter_mut()
            .find(|entry| !entry.is_pending() && entry.message.id == message_id)
    }
}

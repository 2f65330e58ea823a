use std::collections::BTreeMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pantry_types::events::{ClientCommand, SidebarUpdate};
use pantry_types::models::{SidebarEntry, UserId};

use crate::bus::EventBus;
use crate::transport::Inbound;

/// Inbox summary: one entry per conversation partner, keyed by username.
#[derive(Debug, Default, Clone)]
pub struct Sidebar {
    entries: BTreeMap<String, SidebarEntry>,
    current_chat: Option<UserId>,
}

impl Sidebar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every update is a full snapshot.
    pub fn apply(&mut self, update: SidebarUpdate) {
        self.entries = update.data;
        self.current_chat = update.current_chat_id.filter(|id| id.0 != 0);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &SidebarEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn get(&self, username: &str) -> Option<&SidebarEntry> {
        self.entries.get(username)
    }

    pub fn current_chat(&self) -> Option<UserId> {
        self.current_chat
    }

    pub fn total_unread(&self) -> u32 {
        self.entries.values().map(|entry| entry.notif_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ask for `update_sidebar` right away, after every reconnect and then every
/// `every`.
pub fn spawn_refresher(bus: EventBus, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    let mut sub = bus.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let request = || {
            if let Err(e) = bus.emit(ClientCommand::RefreshSidebar) {
                debug!("sidebar refresh not sent: {}", e);
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => request(),
                inbound = sub.recv() => match inbound {
                    Some(Inbound::Connected) => request(),
                    Some(_) => {}
                    None => break,
                },
            }
        }
    })
}

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pantry_types::events::{ClientCommand, ServerEvent};
use pantry_types::models::{Message, MessageId, UserId};

use crate::bus::{EventBus, Subscription};
use crate::error::{ClientError, Result};
use crate::transport::Inbound;

/// Remembered message ids before the set is reset.
const ALERTED_CAP: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

/// Platform side of alerts: window focus, desktop notifications, sound.
pub trait AlertSink: Send + Sync {
    fn is_focused(&self) -> bool;
    fn request_permission(&self) -> Permission;
    fn show_notification(&self, title: &str, body: &str);
    fn play_sound(&self);
}

/// Unread counter plus ambient alerts for new messages.
///
/// The counter is whatever the server last said it is; it is never
/// adjusted locally.
#[derive(Clone)]
pub struct NotificationRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    me: UserId,
    bus: EventBus,
    count: watch::Sender<u32>,
    sink: Arc<dyn AlertSink>,
    /// Asked at most once per session
    permission: Mutex<Option<Permission>>,
    alerted: Mutex<HashSet<MessageId>>,
}

impl NotificationRelay {
    pub fn new(me: UserId, bus: EventBus, sink: Arc<dyn AlertSink>) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(RelayInner {
                me,
                bus,
                count,
                sink,
                permission: Mutex::new(None),
                alerted: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Follow the bus until `cancel` fires or the channel goes away.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        // Subscribe before returning so an immediate Connected is not missed
        let sub = self.inner.bus.subscribe();
        let relay = self.clone();
        tokio::spawn(async move { relay.run(sub, cancel).await })
    }

    async fn run(self, mut sub: Subscription, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                inbound = sub.recv() => match inbound {
                    Some(inbound) => self.handle(&inbound),
                    None => break,
                },
            }
        }
        debug!("notification relay stopped");
    }

    pub fn handle(&self, inbound: &Inbound) {
        match inbound {
            Inbound::Connected => {
                // Counts may have moved while we were away
                if let Err(e) = self.inner.bus.emit(ClientCommand::UpdateMessageCounter) {
                    debug!("counter refresh not sent: {}", e);
                }
            }
            Inbound::Event(ServerEvent::PushNotification { notification_count }) => {
                let count = notification_count.unwrap_or(0);
                self.inner.count.send_replace(count);
                debug!("unread count now {}", count);
            }
            Inbound::Event(ServerEvent::NewMessage(message)) => {
                self.message_arrived(message);
            }
            _ => {}
        }
    }

    pub fn count(&self) -> u32 {
        *self.inner.count.borrow()
    }

    /// Ask the server for the unread count and wait for its push. Needs the
    /// relay task running. The result is always a pushed value, never a
    /// local estimate.
    pub async fn refresh_count(&self, timeout: Duration) -> Result<u32> {
        let mut counts = self.inner.count.subscribe();
        self.inner.bus.emit(ClientCommand::UpdateMessageCounter)?;
        match tokio::time::timeout(timeout, counts.changed()).await {
            Ok(Ok(())) => Ok(*counts.borrow()),
            _ => Err(ClientError::Protocol("no unread count pushed".into())),
        }
    }

    pub fn watch_count(&self) -> watch::Receiver<u32> {
        self.inner.count.subscribe()
    }

    pub fn badge(&self) -> Option<String> {
        badge(self.count())
    }

    /// Ask the platform for notification permission the first time only.
    pub fn ensure_permission(&self) -> Permission {
        let mut permission = match self.inner.permission.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *permission.get_or_insert_with(|| {
            let granted = self.inner.sink.request_permission();
            info!("notification permission: {:?}", granted);
            granted
        })
    }

    /// Sound cue for any message from someone else; a desktop notification
    /// too when the window is not focused and permission was granted. Each
    /// message alerts once. Returns whether it alerted.
    pub fn message_arrived(&self, message: &Message) -> bool {
        if message.sender_id == self.inner.me {
            return false;
        }
        {
            let mut alerted = match self.inner.alerted.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if alerted.len() >= ALERTED_CAP {
                alerted.clear();
            }
            if !alerted.insert(message.id) {
                return false;
            }
        }

        let sink = &self.inner.sink;
        sink.play_sound();

        let granted = match self.inner.permission.lock() {
            Ok(guard) => *guard == Some(Permission::Granted),
            Err(_) => {
                warn!("permission state poisoned");
                false
            }
        };
        if granted && !sink.is_focused() {
            sink.show_notification("New Message", &message.body);
        }
        true
    }
}

/// Zero shows no badge at all; anything else shows the number.
pub fn badge(count: u32) -> Option<String> {
    (count > 0).then(|| count.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use chrono::Utc;

    use crate::bus::TestLink;

    #[derive(Default)]
    struct Recorder {
        focused: AtomicBool,
        deny: AtomicBool,
        asked: AtomicUsize,
        sounds: AtomicUsize,
        shown: Mutex<Vec<String>>,
    }

    impl AlertSink for Recorder {
        fn is_focused(&self) -> bool {
            self.focused.load(Ordering::SeqCst)
        }

        fn request_permission(&self) -> Permission {
            self.asked.fetch_add(1, Ordering::SeqCst);
            if self.deny.load(Ordering::SeqCst) {
                Permission::Denied
            } else {
                Permission::Granted
            }
        }

        fn show_notification(&self, _title: &str, body: &str) {
            self.shown.lock().unwrap().push(body.to_string());
        }

        fn play_sound(&self) {
            self.sounds.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn push(count: Option<u32>) -> Inbound {
        Inbound::Event(ServerEvent::PushNotification {
            notification_count: count,
        })
    }

    fn message(id: i64, from: i64) -> Message {
        Message {
            id: MessageId(id),
            sender_id: UserId(from),
            recipient_id: UserId(if from == 1 { 2 } else { 1 }),
            body: format!("body {}", id),
            timestamp: Utc::now(),
            delivered_at: None,
            read_at: None,
            reactions: Vec::new(),
            seq: None,
            client_id: None,
        }
    }

    fn relay(sink: Arc<Recorder>) -> (NotificationRelay, TestLink) {
        let (bus, link) = TestLink::pair(true);
        (NotificationRelay::new(UserId(1), bus, sink), link)
    }

    #[test]
    fn count_is_replaced_never_accumulated() {
        let (relay, _link) = relay(Arc::new(Recorder::default()));
        assert_eq!(relay.badge(), None);

        relay.handle(&push(Some(0)));
        assert_eq!(relay.count(), 0);
        assert_eq!(relay.badge(), None);

        relay.handle(&push(Some(3)));
        assert_eq!(relay.count(), 3);
        assert_eq!(relay.badge().as_deref(), Some("3"));

        relay.handle(&push(Some(1)));
        assert_eq!(relay.count(), 1);

        // New messages do not touch the counter
        relay.handle(&Inbound::Event(ServerEvent::NewMessage(message(9, 2))));
        assert_eq!(relay.count(), 1);

        relay.handle(&push(None));
        assert_eq!(relay.count(), 0);
    }

    #[test]
    fn connect_requests_counter_refresh() {
        let (relay, mut link) = relay(Arc::new(Recorder::default()));
        relay.handle(&Inbound::Connected);
        relay.handle(&Inbound::Disconnected);
        assert_eq!(link.sent(), vec![ClientCommand::UpdateMessageCounter]);
    }

    #[test]
    fn permission_is_asked_once() {
        let sink = Arc::new(Recorder::default());
        let (relay, _link) = relay(sink.clone());
        assert_eq!(relay.ensure_permission(), Permission::Granted);
        assert_eq!(relay.ensure_permission(), Permission::Granted);
        assert_eq!(sink.asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn alerts_depend_on_focus_and_permission() {
        let sink = Arc::new(Recorder::default());
        let (relay, _link) = relay(sink.clone());

        // Not yet asked: sound only
        assert!(relay.message_arrived(&message(1, 2)));
        assert_eq!(sink.sounds.load(Ordering::SeqCst), 1);
        assert!(sink.shown.lock().unwrap().is_empty());

        relay.ensure_permission();
        assert!(relay.message_arrived(&message(2, 2)));
        assert_eq!(*sink.shown.lock().unwrap(), vec!["body 2".to_string()]);

        sink.focused.store(true, Ordering::SeqCst);
        assert!(relay.message_arrived(&message(3, 2)));
        assert_eq!(sink.sounds.load(Ordering::SeqCst), 3);
        assert_eq!(sink.shown.lock().unwrap().len(), 1);

        // Our own messages and repeats stay quiet
        assert!(!relay.message_arrived(&message(4, 1)));
        assert!(!relay.message_arrived(&message(3, 2)));
        assert_eq!(sink.sounds.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn denied_permission_never_notifies() {
        let sink = Arc::new(Recorder::default());
        sink.deny.store(true, Ordering::SeqCst);
        let (relay, _link) = relay(sink.clone());

        assert_eq!(relay.ensure_permission(), Permission::Denied);
        relay.message_arrived(&message(1, 2));
        assert_eq!(sink.sounds.load(Ordering::SeqCst), 1);
        assert!(sink.shown.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_count_returns_the_pushed_value() {
        let (relay, mut link) = relay(Arc::new(Recorder::default()));
        let cancel = CancellationToken::new();
        let task = relay.spawn(cancel.clone());
        relay.handle(&push(Some(5)));

        let waiting = tokio::spawn({
            let relay = relay.clone();
            async move { relay.refresh_count(Duration::from_secs(5)).await }
        });
        while link.sent().is_empty() {
            tokio::task::yield_now().await;
        }

        // The server now says zero; the old value must not win
        link.deliver(ServerEvent::PushNotification {
            notification_count: Some(0),
        });
        assert_eq!(waiting.await.unwrap().unwrap(), 0);
        assert_eq!(relay.badge(), None);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_count_fails_without_a_push() {
        let (relay, _link) = relay(Arc::new(Recorder::default()));
        let err = relay.refresh_count(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));

        let (bus, _offline) = TestLink::pair(false);
        let relay = NotificationRelay::new(UserId(1), bus, Arc::new(Recorder::default()));
        assert!(matches!(
            relay.refresh_count(Duration::from_secs(1)).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_relay_task_follows_the_bus() {
        let (relay, mut link) = relay(Arc::new(Recorder::default()));
        let mut counts = relay.watch_count();
        let cancel = CancellationToken::new();
        let task = relay.spawn(cancel.clone());

        link.set_connected(true);
        link.deliver(ServerEvent::PushNotification {
            notification_count: Some(0),
        });
        link.deliver(ServerEvent::PushNotification {
            notification_count: Some(3),
        });

        counts.wait_for(|count| *count == 3).await.unwrap();
        assert_eq!(relay.badge().as_deref(), Some("3"));
        assert_eq!(link.sent(), vec![ClientCommand::UpdateMessageCounter]);

        cancel.cancel();
        task.await.unwrap();
    }
}

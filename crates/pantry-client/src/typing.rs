use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pantry_types::events::ClientCommand;
use pantry_types::models::UserId;

use crate::bus::EventBus;

enum Signal {
    Keystroke,
    /// Input was submitted or cleared
    Stop,
}

/// Debounced outbound typing signal for one conversation.
///
/// The first keystroke after a quiet period emits `typing=true`; once no
/// keystroke has arrived for the quiet interval, exactly one `typing=false`
/// follows. Keystrokes in between push the deadline back and repeat
/// `typing=true` once `refresh` has passed since the last one, so the
/// peer's expiry never lapses during a long burst.
pub struct TypingDebouncer {
    tx: mpsc::UnboundedSender<Signal>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TypingDebouncer {
    pub fn spawn(
        bus: EventBus,
        recipient: UserId,
        quiet: Duration,
        refresh: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = parent.child_token();
        let timing = Timing { quiet, refresh };
        let task = tokio::spawn(debounce(bus, recipient, timing, rx, cancel.clone()));
        Self { tx, cancel, task }
    }

    pub fn keystroke(&self) {
        let _ = self.tx.send(Signal::Keystroke);
    }

    /// Send `typing=false` now if we were typing.
    pub fn stop(&self) {
        let _ = self.tx.send(Signal::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TypingDebouncer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone, Copy)]
struct Timing {
    quiet: Duration,
    refresh: Duration,
}

async fn debounce(
    bus: EventBus,
    recipient: UserId,
    timing: Timing,
    mut rx: mpsc::UnboundedReceiver<Signal>,
    cancel: CancellationToken,
) {
    let emit = |is_typing: bool| {
        let cmd = ClientCommand::HandleTyping {
            recipient_id: recipient,
            is_typing,
        };
        if let Err(e) = bus.emit(cmd) {
            debug!("typing={} not sent: {}", is_typing, e);
        }
    };

    loop {
        // Idle until someone types
        tokio::select! {
            _ = cancel.cancelled() => return,
            signal = rx.recv() => match signal {
                Some(Signal::Keystroke) => {}
                Some(Signal::Stop) => continue,
                None => return,
            },
        }

        emit(true);
        let mut last_true = Instant::now();
        let mut deadline = last_true + timing.quiet;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    emit(false);
                    return;
                }
                signal = rx.recv() => match signal {
                    Some(Signal::Keystroke) => {
                        let now = Instant::now();
                        deadline = now + timing.quiet;
                        if now >= last_true + timing.refresh {
                            emit(true);
                            last_true = now;
                        }
                    }
                    Some(Signal::Stop) => {
                        emit(false);
                        break;
                    }
                    None => {
                        emit(false);
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    emit(false);
                    break;
                }
            }
        }
    }
}

/// Inbound typing flags, one per remote user.
///
/// A `typing=true` holds only for the expiry window unless refreshed, so a
/// lost `typing=false` cannot leave the indicator on.
pub struct TypingIndicator {
    expiry: Duration,
    typing: HashMap<UserId, Instant>,
}

impl TypingIndicator {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            typing: HashMap::new(),
        }
    }

    pub fn apply(&mut self, user_id: UserId, is_typing: bool) {
        if is_typing {
            self.typing.insert(user_id, Instant::now() + self.expiry);
        } else {
            self.typing.remove(&user_id);
        }
    }

    pub fn is_typing(&self, user_id: UserId) -> bool {
        self.typing
            .get(&user_id)
            .is_some_and(|deadline| *deadline > Instant::now())
    }

    /// When the flag for `user_id` lapses, if it is set.
    pub fn expires_at(&self, user_id: UserId) -> Option<Instant> {
        self.typing.get(&user_id).copied()
    }

    /// Drop lapsed flags and return whose they were.
    pub fn prune(&mut self) -> Vec<UserId> {
        let now = Instant::now();
        let expired: Vec<UserId> = self
            .typing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(user_id, _)| *user_id)
            .collect();
        for user_id in &expired {
            self.typing.remove(user_id);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.typing.clear();
    }
}

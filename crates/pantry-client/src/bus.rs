use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::warn;

use pantry_types::events::ClientCommand;

use crate::error::{ClientError, Result};
use crate::transport::{ConnectionState, Inbound};

/// Named events in, named actions out, over the session's channel.
///
/// Cheap to clone; every view holds its own handle.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    /// Drained by the connection task onto the live link
    outbound: mpsc::UnboundedSender<ClientCommand>,

    /// Fan-out of everything the channel receives
    inbound: broadcast::Sender<Inbound>,

    state: watch::Receiver<ConnectionState>,
}

impl EventBus {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<ClientCommand>,
        inbound: broadcast::Sender<Inbound>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                outbound,
                inbound,
                state,
            }),
        }
    }

    /// Fire-and-forget. Fails fast when there is no live link; nothing is
    /// queued for a later connection.
    pub fn emit(&self, cmd: ClientCommand) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.inner
            .outbound
            .send(cmd)
            .map_err(|_| ClientError::NotConnected)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.inbound.subscribe(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected(_))
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Inbound>,
}

impl Subscription {
    /// Next inbound item, or `None` once the channel is gone. A subscriber
    /// that falls behind skips what it missed.
    pub async fn recv(&mut self) -> Option<Inbound> {
        loop {
            match self.rx.recv().await {
                Ok(item) => return Some(item),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event subscriber lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The far side of a bus with no socket behind it, for driving components
/// in tests.
#[cfg(test)]
pub(crate) struct TestLink {
    pub outbound: mpsc::UnboundedReceiver<ClientCommand>,
    pub inbound: broadcast::Sender<Inbound>,
    pub state: watch::Sender<ConnectionState>,
}

#[cfg(test)]
impl TestLink {
    pub fn pair(connected: bool) -> (EventBus, Self) {
        use crate::config::TransportKind;

        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(64);
        let initial = if connected {
            ConnectionState::Connected(TransportKind::WebSocket)
        } else {
            ConnectionState::Disconnected
        };
        let (state, state_rx) = watch::channel(initial);
        let bus = EventBus::new(outbound_tx, inbound.clone(), state_rx);
        (
            bus,
            Self {
                outbound,
                inbound,
                state,
            },
        )
    }

    pub fn deliver(&self, event: pantry_types::events::ServerEvent) {
        let _ = self.inbound.send(Inbound::Event(event));
    }

    /// Everything emitted so far.
    pub fn sent(&mut self) -> Vec<ClientCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.outbound.try_recv() {
            out.push(cmd);
        }
        out
    }

    pub fn set_connected(&self, connected: bool) {
        use crate::config::TransportKind;

        if connected {
            self.state
                .send_replace(ConnectionState::Connected(TransportKind::WebSocket));
            let _ = self.inbound.send(Inbound::Connected);
        } else {
            self.state.send_replace(ConnectionState::Disconnected);
            let _ = self.inbound.send(Inbound::Disconnected);
        }
    }
}

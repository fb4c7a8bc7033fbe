use parley_common::Inbound;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

pub const EVENT_CAPACITY: usize = 256;

/// Outcomes the coordinator reports to whoever drives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// An inbound message, file or unparsed text.
    MessageReceived(Inbound),
    SendOutcome {
        username: String,
        success: bool,
        error: Option<String>,
    },
    /// Fires once per peer, when its key is stored and it becomes `Connected`.
    KeyExchangeComplete { username: String },
    /// A peer wants to connect; answer with `accept_incoming` or `refuse_incoming`.
    IncomingConnectionRequest {
        username: String,
        host: String,
        port: u16,
    },
    ConnectionStatusChanged {
        username: String,
        connected: bool,
        detail: Option<String>,
    },
}

/// A live subscription to [`PeerEvent`]s.
///
/// Events sent before the subscription was created are not seen.
pub struct EventSubscription {
    rx: broadcast::Receiver<PeerEvent>,
}

impl EventSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<PeerEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the coordinator is gone.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving events.
    pub fn unsubscribe(self) {
        debug!("event subscription dropped");
    }
}

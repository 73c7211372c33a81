//! String transports between host and sandbox.
//!
//! The platform can hand us the same logical stream through two independent
//! event channels. Both are registered on one [`Inbox`] so a single dispatcher
//! handles them; ordering holds within a channel, not across channels.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{decode, encode, Message, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Document,
    Window,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Document => "document",
            Channel::Window => "window",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: Channel,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("{0:?} transport is closed")]
pub struct TransportClosed(pub Channel);

/// Sending half of one registered channel.
#[derive(Debug, Clone)]
pub struct TransportEndpoint {
    channel: Channel,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl TransportEndpoint {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn deliver(&self, raw: impl Into<String>) -> Result<(), TransportClosed> {
        self.tx
            .send(Delivery {
                channel: self.channel,
                raw: raw.into(),
            })
            .map_err(|_| TransportClosed(self.channel))
    }
}

pub struct Inbox {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn register_transport(&self, channel: Channel) -> TransportEndpoint {
        TransportEndpoint {
            channel,
            tx: self.tx.clone(),
        }
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Waits for the next delivery that decodes as `M`, dropping the rest.
    pub async fn next_message<M: Message>(&mut self) -> Option<(Channel, M)> {
        loop {
            let delivery = self.rx.recv().await?;
            if let Some(message) = on_receive::<M>(&delivery) {
                return Some((delivery.channel, message));
            }
        }
    }
}

/// Decodes one delivery. Transport-level failures are logged and swallowed.
pub fn on_receive<M: Message>(delivery: &Delivery) -> Option<M> {
    match decode::<M>(&delivery.raw) {
        Ok(message) => {
            debug!(channel = delivery.channel.as_str(), kind = message.kind(), "received message");
            Some(message)
        }
        Err(ProtocolError::UnknownMessageType(kind)) => {
            warn!(channel = delivery.channel.as_str(), %kind, "dropping message of unknown type");
            None
        }
        Err(err) => {
            warn!(
                channel = delivery.channel.as_str(),
                error = %err,
                "dropping undecodable message"
            );
            None
        }
    }
}

/// Ordered list of outbound transports; the first live one carries the message.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    routes: Vec<TransportEndpoint>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, endpoint: TransportEndpoint) -> Self {
        self.routes.push(endpoint);
        self
    }

    pub fn add_route(&mut self, endpoint: TransportEndpoint) {
        self.routes.push(endpoint);
    }

    pub fn send<M: Message>(&self, message: &M) {
        let raw = match encode(message) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound message");
                return;
            }
        };

        for (idx, route) in self.routes.iter().enumerate() {
            match route.deliver(raw.clone()) {
                Ok(()) => {
                    if idx > 0 {
                        debug!(
                            channel = route.channel().as_str(),
                            kind = message.kind(),
                            "delivered on fallback transport"
                        );
                    }
                    return;
                }
                Err(err) => {
                    debug!(error = %err, kind = message.kind(), "transport unavailable");
                }
            }
        }

        warn!(kind = message.kind(), "no live transport, message dropped");
    }
}

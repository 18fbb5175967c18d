//! Frontend event bus
//!
//! Mirrors the network layer's event channel pattern: the constructor hands
//! back the receiver, publishers never block.

use crate::frontend::message::{AgentId, Message};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum Event {
    /// An agent reported CLIENT_KILLED while executing a leased task.
    ClientCrash { agent: AgentId, message: Message },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ClientCrash { .. } => "ClientCrash",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!("event bus receiver dropped, event discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::message::SessionId;

    #[test]
    fn test_publish_and_receive() {
        let (bus, mut rx) = EventBus::channel();
        let message = Message::data(SessionId::from("sessions/S1"), 5, 7, Vec::new());
        bus.publish(Event::ClientCrash {
            agent: AgentId::from("A2"),
            message,
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.name(), "ClientCrash");
    }

    #[test]
    fn test_publish_without_receiver_is_silent() {
        let (bus, rx) = EventBus::channel();
        drop(rx);
        let message = Message::data(SessionId::from("sessions/S1"), 1, 1, Vec::new());
        bus.publish(Event::ClientCrash {
            agent: AgentId::from("A1"),
            message,
        });
    }
}

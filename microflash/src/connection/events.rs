//! Connection events and their fan-out to subscribers.

use {
    super::ConnectionStatus,
    crate::{error::DeviceError, flash::FlashKind},
    std::sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, Sender},
    },
};

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection moved to a new status.
    Status(ConnectionStatus),
    /// Text received from the board's serial port.
    SerialData(String),
    /// The serial loop stopped on an error.
    SerialError(DeviceError),
    /// Serial output restarts; earlier output no longer belongs to the
    /// running program.
    SerialReset,
    /// A flash completed.
    Flash(FlashKind),
}

/// Delivers events to every live subscriber.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<ConnectionEvent>>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Send `event` to all subscribers, dropping those that hung up.
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| {
                tx.send(event.clone())
                    .is_ok()
            });
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }
}

//! Cross-document messaging channel.
//!
//! The hosting shell forwards every `message` event the frame receives
//! and performs `postMessage(message, targetOrigin)` on our behalf. This
//! module only abstracts the two directions:
//!
//! - [`MessagePort`]: outbound, one call per (envelope, target origin);
//! - [`MessageListener`]: inbound, a scoped subscription to message events.
pub mod stdio;

use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::{Envelope, FrameEvent};

pub use stdio::StdoutPort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// The channel to the hosting shell is gone.
    Closed,
    Io(String),
    Encode(String),
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("message channel closed"),
            Self::Io(e) => write!(f, "message channel I/O error: {e}"),
            Self::Encode(e) => write!(f, "envelope encoding failed: {e}"),
        }
    }
}

impl std::error::Error for PortError {}

/// Outbound side of the channel, the equivalent of `window.parent.postMessage`.
pub trait MessagePort: Send + Sync {
    fn post_message(&self, message: &Envelope, target_origin: &str) -> Result<(), PortError>;
}

/// Inbound message events. Attached once at startup; dropping it
/// detaches the listener and stops whatever feeds it.
pub struct MessageListener {
    events: mpsc::Receiver<FrameEvent>,
    feeder: Option<JoinHandle<()>>,
}

impl MessageListener {
    /// Listener fed by an in-process channel (embedding, tests).
    pub fn from_channel(events: mpsc::Receiver<FrameEvent>) -> Self {
        Self {
            events,
            feeder: None,
        }
    }

    /// Listener fed by a background task that owns the sending half.
    pub fn with_feeder(events: mpsc::Receiver<FrameEvent>, feeder: JoinHandle<()>) -> Self {
        Self {
            events,
            feeder: Some(feeder),
        }
    }

    /// Next message event; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<FrameEvent> {
        self.events.recv().await
    }
}

impl Drop for MessageListener {
    fn drop(&mut self) {
        self.events.close();
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        debug!("Message listener detached");
    }
}

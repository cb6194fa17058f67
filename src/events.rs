//! The event stream observers subscribe to for state changes and outputs.
//!
//! Unlike the single-consumer channel a one-off command might use, this is a
//! broadcast: every [`EventBus::subscribe`] caller gets its own receiver and
//! sees every event from the point it subscribed, independent of the
//! session's own request/reply bookkeeping.

use tokio::sync::broadcast;

use crate::codec::KernelInfoReply;
use crate::output::Output;
use crate::session::KernelState;

/// Capacity of the broadcast channel. A slow subscriber that falls behind by
/// more than this many events starts missing the oldest ones, observable as
/// a `RecvError::Lagged` from its receiver.
const CHANNEL_CAPACITY: usize = 256;

/// An event emitted by a [`crate::Session`].
#[derive(Clone, Debug)]
pub enum Event {
    /// The kernel's state machine transitioned to a new state.
    StateChange(KernelState),
    /// An output was produced, tagged with the id of the execution that
    /// produced it when one is known.
    Output {
        /// The output itself.
        output: Output,
        /// The `msg_id` of the `execute_request` this output responds to, if
        /// the iopub message carried a recognizable parent header.
        parent_msg_id: Option<String>,
    },
    /// The kernel answered a `kernel_info_request`. Emitted once after a
    /// successful reply during `start`.
    KernelInfo(KernelInfoReply),
    /// A spawn error or unrecoverable transport error occurred.
    Error(String),
}

/// Broadcast bus that fans a single sequence of [`Event`]s out to any number
/// of independent subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new, empty event bus.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus { tx }
    }

    /// Subscribe to future events. Events emitted before this call are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event to every current subscriber. A lack of subscribers is
    /// not an error.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

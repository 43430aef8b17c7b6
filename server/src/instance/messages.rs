//! Messages accepted by [`super::RelayInstanceActor`].
//!
//! Request-reply variants carry an embedded `oneshot::Sender`,
//! fire-and-forget variants don't.
//! Because the whole instance is a single actor, one mailbox processing
//! these sequentially is what gives the per-connection frame ordering and
//! lock-free state access.

use tokio::sync::{mpsc, oneshot};

use crate::protocol::{ClientFrame, ServerFrame};
use crate::session::SessionAttachment;

#[derive(Debug)]
pub enum InstanceMessage {
    /// Registers (or re-registers after rehydration) a session's outbox and
    /// issues an AUTH challenge if required. Idempotent: a session already
    /// present in memory is left untouched. Always sent once at upgrade time
    /// and again, on demand, whenever [`InstanceMessage::Frame`] finds the
    /// session missing.
    Rehydrate {
        attachment: SessionAttachment,
        outbox: mpsc::UnboundedSender<ServerFrame>,
        reply: oneshot::Sender<()>,
    },

    /// One parsed client frame. Carries the session's attachment (not just
    /// its id) so the handler can rehydrate transparently if the in-memory
    /// session is missing — e.g. evicted by the Lifecycle Timer or lost to
    /// an actor restart — before dispatching. Rehydration is idempotent, so
    /// this is a no-op in the common case where the session is already
    /// attached. The calling reader task blocks on `reply` before reading
    /// its next frame, which is what gives per-connection FIFO ordering.
    Frame {
        attachment: SessionAttachment,
        outbox: mpsc::UnboundedSender<ServerFrame>,
        frame: ClientFrame,
        reply: oneshot::Sender<()>,
    },

    /// The socket closed or errored; purges in-memory state and persisted
    /// subscriptions for this session.
    Disconnect { session_id: String },

    /// An event relayed from a sibling instance via `POST /do-broadcast`.
    /// Replies with whether this instance had already seen it.
    InboundBroadcast {
        event: crate::event::Event,
        reply: oneshot::Sender<bool>,
    },

    /// Periodic idle check.
    Alarm,
}

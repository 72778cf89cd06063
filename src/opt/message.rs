//! Simulation messages exchanged between logical processes.

use crate::model::{AtomicId, PinValue};
use crate::time::SuperDenseTime;

/// The payload of a [`Message`].
#[derive(Debug, Clone)]
pub enum MessageKind<X> {
    /// An output value routed to the receiving process as input.
    Io(PinValue<X>),
    /// An anti-message: every message the sender previously sent with a
    /// timestamp at or after `Message::t` is cancelled.
    Rollback,
}

/// A timestamped message from one logical process to another.
#[derive(Debug, Clone)]
pub struct Message<X> {
    /// The super-dense timestamp of the carried event.
    pub t: SuperDenseTime,
    /// The logical process (by atomic id) that generated the message.
    pub src: AtomicId,
    /// Input value or rollback notice.
    pub kind: MessageKind<X>,
}

impl<X> Message<X> {
    /// Returns `true` for anti-messages.
    pub fn is_rollback(&self) -> bool {
        matches!(self.kind, MessageKind::Rollback)
    }
}

//! Queue node: a message plus the per-push ack bookkeeping it needs while
//! it's in transit through a [`crate::Queue`] (§3 `QueueNode`).

use logflow_core::{Message, PathOptions};

/// One entry in any of the queue's internal lists.
///
/// Keeping `ack_needed`/`flow_control_requested` on the node (copied out
/// of `PathOptions` at push time) rather than reading them off the
/// message: the node, not the message, is what the queue's internal
/// bookkeeping (overflow drop, backlog ack/rewind) acts on, so it needs
/// its own copy even though the message is shared.
pub struct QueueNode {
    pub message: Message,
    pub ack_needed: bool,
    pub flow_control_requested: bool,
}

impl QueueNode {
    pub fn new(message: Message, path_options: PathOptions) -> Self {
        Self {
            message,
            ack_needed: path_options.ack_needed,
            flow_control_requested: path_options.flow_control_requested,
        }
    }

    pub fn path_options(&self) -> PathOptions {
        PathOptions {
            ack_needed: self.ack_needed,
            flow_control_requested: self.flow_control_requested,
        }
    }
}

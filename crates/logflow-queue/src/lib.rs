//! The message queue (C3): a scalable producer/consumer FIFO with an
//! in-flight backlog for ack/rewind bookkeeping.

pub mod node;
pub mod queue;
pub mod throttle;

pub use node::QueueNode;
pub use queue::{PushOutcome, Queue, QueueStats};
pub use throttle::Throttle;

#[cfg(test)]
mod tests {
    use super::*;
    use logflow_core::{Message, PathOptions, Tag};

    fn msg(body: &str) -> Message {
        Message::new(body.as_bytes().to_vec(), Tag::empty(), 6)
    }

    #[test]
    fn fast_path_push_then_flush_then_pop() {
        let q = Queue::new(16, "q1");
        let outcome = q.push_tail_fast(0, QueueNode::new(msg("a"), PathOptions::default()));
        assert_eq!(outcome, PushOutcome::AcceptedFirstInBatch);
        let outcome = q.push_tail_fast(0, QueueNode::new(msg("b"), PathOptions::default()));
        assert_eq!(outcome, PushOutcome::Accepted);

        // Nothing visible to pop_head until the slot is flushed.
        assert!(q.pop_head().is_none());

        q.flush_input(0);
        assert_eq!(q.len(), 2);

        let (node, _) = q.pop_head().unwrap();
        assert_eq!(node.message.body(), b"a");
        let (node, _) = q.pop_head().unwrap();
        assert_eq!(node.message.body(), b"b");
        assert!(q.pop_head().is_none());
    }

    #[test]
    fn slow_path_respects_capacity() {
        let q = Queue::new(2, "q2");
        assert_eq!(
            q.push_tail_slow(QueueNode::new(msg("a"), PathOptions::default())),
            PushOutcome::Accepted
        );
        assert_eq!(
            q.push_tail_slow(QueueNode::new(msg("b"), PathOptions::default())),
            PushOutcome::Accepted
        );
        assert_eq!(
            q.push_tail_slow(QueueNode::new(msg("c"), PathOptions::default())),
            PushOutcome::Dropped
        );
        assert_eq!(q.len(), 2);
        assert_eq!(q.stats().dropped_messages, 1);
    }

    #[test]
    fn flush_input_drops_oldest_excess_items() {
        let q = Queue::new(2, "q3");
        for c in ["a", "b", "c", "d"] {
            q.push_tail_fast(0, QueueNode::new(msg(c), PathOptions::default()));
        }
        q.flush_input(0);
        assert_eq!(q.len(), 2);
        assert_eq!(q.stats().dropped_messages, 2);
        // The two survivors should be the newest two pushed.
        let (n1, _) = q.pop_head().unwrap();
        let (n2, _) = q.pop_head().unwrap();
        assert_eq!(n1.message.body(), b"c");
        assert_eq!(n2.message.body(), b"d");
    }

    #[test]
    fn backlog_ack_and_rewind_all() {
        let q = Queue::new(16, "q4").with_backlog(true);
        for c in ["a", "b", "c"] {
            q.push_tail_slow(QueueNode::new(msg(c), PathOptions::default()));
        }
        let (_, _) = q.pop_head().unwrap();
        let (_, _) = q.pop_head().unwrap();
        assert_eq!(q.backlog_len(), 2);

        q.rewind_backlog_all();
        assert_eq!(q.backlog_len(), 0);
        assert_eq!(q.len(), 3);

        let (n, _) = q.pop_head().unwrap();
        assert_eq!(n.message.body(), b"a");
    }

    #[test]
    fn partial_rewind_preserves_order() {
        let q = Queue::new(16, "q5").with_backlog(true);
        for c in ["a", "b", "c"] {
            q.push_tail_slow(QueueNode::new(msg(c), PathOptions::default()));
        }
        q.pop_head().unwrap();
        q.pop_head().unwrap();
        q.pop_head().unwrap();
        assert_eq!(q.backlog_len(), 3);

        // Only the last two (b, c) get rewound back for retry.
        q.rewind_backlog(2);
        assert_eq!(q.backlog_len(), 1);

        let (n1, _) = q.pop_head().unwrap();
        let (n2, _) = q.pop_head().unwrap();
        assert_eq!(n1.message.body(), b"b");
        assert_eq!(n2.message.body(), b"c");
    }

    #[test]
    fn is_empty_racy_sees_unflushed_input() {
        let q = Queue::new(16, "q6");
        assert!(q.is_empty_racy());
        q.push_tail_fast(0, QueueNode::new(msg("a"), PathOptions::default()));
        assert!(!q.is_empty_racy());
    }

    #[test]
    fn check_items_reports_empty_then_installs_wakeup() {
        let q = Queue::new(16, "q7");
        let (has_items, wait) = q.check_items(|| {});
        assert!(!has_items);
        assert_eq!(wait, std::time::Duration::ZERO);

        q.push_tail_slow(QueueNode::new(msg("a"), PathOptions::default()));
        let (has_items, _) = q.check_items(|| {});
        assert!(has_items);
    }

    #[test]
    fn check_items_fires_installed_wakeup_on_push() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let q = Queue::new(16, "q8");
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let (has_items, _) = q.check_items(move || fired2.store(true, Ordering::SeqCst));
        assert!(!has_items);
        assert!(!fired.load(Ordering::SeqCst));

        q.push_tail_slow(QueueNode::new(msg("a"), PathOptions::default()));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn flow_controlled_push_is_never_dropped_on_overflow() {
        let q = Queue::new(1, "q10");
        assert_eq!(
            q.push_tail_slow(QueueNode::new(msg("a"), PathOptions::default())),
            PushOutcome::Accepted
        );
        // Queue is already at capacity, but a flow-controlled push must
        // still be accepted rather than dropped (§4.3 invariant 3).
        let flow_controlled = PathOptions {
            ack_needed: true,
            flow_control_requested: true,
        };
        assert_eq!(
            q.push_tail_slow(QueueNode::new(msg("b"), flow_controlled)),
            PushOutcome::Accepted
        );
        assert_eq!(q.len(), 2);
        assert_eq!(q.stats().dropped_messages, 0);
    }

    #[test]
    fn flush_input_drops_only_non_flow_controlled_excess() {
        let q = Queue::new(1, "q11");
        let flow_controlled = PathOptions {
            ack_needed: true,
            flow_control_requested: true,
        };
        q.push_tail_fast(0, QueueNode::new(msg("a"), PathOptions::default()));
        q.push_tail_fast(0, QueueNode::new(msg("b"), flow_controlled));
        q.push_tail_fast(0, QueueNode::new(msg("c"), PathOptions::default()));
        q.flush_input(0);

        // "a" and "c" are over the capacity-1 budget and droppable; "b"
        // rides along regardless since it's flow-controlled.
        assert_eq!(q.stats().dropped_messages, 2);
        assert_eq!(q.len(), 1);
        let (n, _) = q.pop_head().unwrap();
        assert_eq!(n.message.body(), b"b");
    }

    #[test]
    fn overflow_scenario_matches_expected_drop_and_queued_counts() {
        // Mirrors the documented overflow scenario: capacity=5, push 5
        // flow-controlled, then 3 non-flow-controlled, then 2
        // flow-controlled, then 5 more flow-controlled.
        let q = Queue::new(5, "q12").with_backlog(true);
        let flow_controlled = PathOptions {
            ack_needed: true,
            flow_control_requested: true,
        };
        let not_flow_controlled = PathOptions {
            ack_needed: true,
            flow_control_requested: false,
        };

        for _ in 0..5 {
            q.push_tail_slow(QueueNode::new(msg("f"), flow_controlled));
        }
        for _ in 0..3 {
            q.push_tail_slow(QueueNode::new(msg("n"), not_flow_controlled));
        }
        for _ in 0..2 {
            q.push_tail_slow(QueueNode::new(msg("f"), flow_controlled));
        }
        for _ in 0..5 {
            q.push_tail_slow(QueueNode::new(msg("f"), flow_controlled));
        }

        assert_eq!(q.stats().dropped_messages, 3);
        assert_eq!(q.len(), 12);

        let mut acked = 0;
        while let Some((_, _)) = q.pop_head() {
            acked += 1;
        }
        q.ack_backlog(acked);
        assert_eq!(acked, 12);
        assert_eq!(q.backlog_len(), 0);
    }

    #[test]
    fn throttle_caps_pop_rate() {
        let q = Queue::new(16, "q9").with_throttle(2);
        for c in ["a", "b", "c"] {
            q.push_tail_slow(QueueNode::new(msg(c), PathOptions::default()));
        }
        assert!(q.pop_head_throttled().is_ok());
        assert!(q.pop_head_throttled().is_ok());
        // Bucket starts full at `limit_per_sec` (2); third pop should be
        // throttled with a positive retry-after.
        match q.pop_head_throttled() {
            Err(wait) => assert!(wait > std::time::Duration::ZERO),
            Ok(_) => panic!("expected throttle to block the third pop"),
        }
        assert_eq!(q.len(), 1);
    }
}

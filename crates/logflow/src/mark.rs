//! `MARK` message generation (§6.5 `mark_mode`, §4.5 C5).
//!
//! A `MarkGenerator` is a production consumer of [`BatchedTimer`]: fixed
//! interval modes (`Global`/`Periodical`/`Internal`) arm the timer once at
//! construction and re-arm it from inside its own fire handler, so marks
//! keep landing on a steady cadence for as long as the pipeline runs.
//! Idle modes (`DstIdle`/`HostIdle`) never self-arm; `Pipeline::push`
//! calls [`MarkGenerator::touch`] on every push instead, which postpones
//! the same timer, so a mark only fires once a destination has gone
//! `mark_interval` without seeing traffic.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use logflow_core::{MarkMode, Message, PathOptions, Tag};
use logflow_queue::{Queue, QueueNode};
use logflow_runtime::{BatchedTimer, MainLoopHandle};

pub struct MarkGenerator {
    mode: MarkMode,
    interval: Duration,
    timer: Option<BatchedTimer>,
}

impl MarkGenerator {
    pub fn new(
        handle: MainLoopHandle,
        driver_name: impl Into<String>,
        mode: MarkMode,
        interval: Duration,
        queue: Arc<Queue>,
    ) -> Self {
        let driver_name = driver_name.into();
        if mode == MarkMode::None {
            return Self { mode, interval, timer: None };
        }

        let tags = if mode == MarkMode::Internal {
            Tag::MARK | Tag::INTERNAL
        } else {
            Tag::MARK
        };

        // The fire handler needs to re-arm the very timer it runs on;
        // `BatchedTimer::new` wants the handler before the timer exists,
        // so the timer is handed to its own handler through a slot filled
        // in right after construction.
        let slot: Arc<OnceLock<BatchedTimer>> = Arc::new(OnceLock::new());
        let slot_for_handler = Arc::clone(&slot);
        let fire_interval = interval;
        let fire_driver = driver_name.clone();
        let timer = BatchedTimer::new(handle, move || {
            tracing::debug!(driver = %fire_driver, ?mode, "emitting MARK message");
            let mark = Message::new(Vec::new(), tags, 6);
            queue.push_tail_slow(QueueNode::new(mark, PathOptions::default()));
            if let Some(timer) = slot_for_handler.get() {
                timer.postpone(fire_interval);
            }
        });
        let _ = slot.set(timer.clone());

        if matches!(mode, MarkMode::Global | MarkMode::Periodical | MarkMode::Internal) {
            timer.postpone(interval);
        }

        Self { mode, interval, timer: Some(timer) }
    }

    /// Reset the idle clock on destination activity. No-op for
    /// fixed-interval modes and when mark generation is disabled.
    pub fn touch(&self) {
        if matches!(self.mode, MarkMode::DstIdle | MarkMode::HostIdle) {
            if let Some(timer) = &self.timer {
                timer.postpone(self.interval);
            }
        }
    }
}

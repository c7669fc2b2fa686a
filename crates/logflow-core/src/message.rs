//! The `Message` data model (§3).
//!
//! A `Message` is an opaque, reference-counted, immutable payload.
//! "Ref/unref" is just `Clone`/`Drop` on an `Arc`-backed handle; mutating
//! a message without disturbing readers still looking at the unmodified
//! copy goes through the explicit `Message::fork` below, which
//! copy-on-writes the value map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

bitflags::bitflags! {
    /// Per-message tag bitset (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Tag: u32 {
        const INTERNAL      = 1 << 0;
        const MARK          = 1 << 1;
        const LOCAL         = 1 << 2;
        const UTF8          = 1 << 3;
        const STATE_TRACING = 1 << 4;
    }
}

/// Which of the message's timestamps is being read/written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampKind {
    /// When the source first observed the message.
    Received,
    /// The message's own embedded timestamp (e.g. parsed from the payload).
    Stamp,
}

#[derive(Debug, Clone, Copy)]
struct Timestamps {
    received: SystemTime,
    stamp: SystemTime,
}

/// The three outcomes an ack can resolve to (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AckStatus {
    /// Delivered (or intentionally, permanently dropped) successfully.
    Processed = 0,
    /// Not delivered; the source should treat this as back-pressure and may
    /// redeliver. Produced e.g. by a queue overflow on a flow-controlled path.
    Suspended = 1,
    /// Delivery was abandoned, e.g. because the pipeline is tearing down
    /// with messages still in transit.
    Aborted = 2,
}

/// Per-push options threaded alongside a message through the queue.
///
/// `ack_needed` says whether this particular path through the pipeline
/// needs an ack callback invoked at all; `flow_control_requested` says
/// whether the source can be back-pressured instead of having the
/// message dropped on overflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathOptions {
    pub ack_needed: bool,
    pub flow_control_requested: bool,
}

type AckFn = Box<dyn Fn(AckStatus) + Send + Sync>;

/// Tracks outstanding acks for a message that may have fanned out to
/// multiple destinations. The registered callback fires exactly once,
/// when the last outstanding ack resolves, with the worst status seen
/// (`Aborted` > `Suspended` > `Processed`).
struct AckGroupInner {
    outstanding: AtomicUsize,
    worst: AtomicU8,
    on_complete: AckFn,
}

#[derive(Clone)]
pub struct AckGroup(Arc<AckGroupInner>);

impl AckGroup {
    pub fn new(on_complete: impl Fn(AckStatus) + Send + Sync + 'static) -> Self {
        Self(Arc::new(AckGroupInner {
            outstanding: AtomicUsize::new(0),
            worst: AtomicU8::new(AckStatus::Processed as u8),
            on_complete: Box::new(on_complete),
        }))
    }

    /// Register one more outstanding ack for this group (§6.1 `add_ack`).
    pub fn add_ack(&self) {
        self.0.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Resolve one outstanding ack (§6.1 `ack`). When the last one
    /// resolves, the group's completion callback runs with the worst
    /// status observed across all acks.
    pub fn ack(&self, status: AckStatus) {
        self.0.worst.fetch_max(status as u8, Ordering::AcqRel);
        if self.0.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let worst = self.0.worst.load(Ordering::Acquire);
            let status = match worst {
                0 => AckStatus::Processed,
                1 => AckStatus::Suspended,
                _ => AckStatus::Aborted,
            };
            (self.0.on_complete)(status);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.0.outstanding.load(Ordering::Acquire)
    }
}

struct MessageInner {
    body: Vec<u8>,
    tags: Tag,
    priority: i32,
    timestamps: Timestamps,
    values: RwLock<Arc<HashMap<String, Vec<u8>>>>,
    ack_group: RwLock<Option<AckGroup>>,
}

/// A reference-counted, otherwise-immutable log message.
///
/// `Clone` bumps the refcount; letting the last clone drop runs the
/// decrement implicitly. The name-value map is copy-on-write:
/// `set_value` only allocates a new `HashMap` if the current one is
/// shared with another clone.
#[derive(Clone)]
pub struct Message(Arc<MessageInner>);

impl Message {
    pub fn new(body: impl Into<Vec<u8>>, tags: Tag, priority: i32) -> Self {
        let now = SystemTime::now();
        Self(Arc::new(MessageInner {
            body: body.into(),
            tags,
            priority,
            timestamps: Timestamps {
                received: now,
                stamp: now,
            },
            values: RwLock::new(Arc::new(HashMap::new())),
            ack_group: RwLock::new(None),
        }))
    }

    pub fn body(&self) -> &[u8] {
        &self.0.body
    }

    pub fn tag(&self) -> Tag {
        self.0.tags
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.0.tags.contains(tag)
    }

    pub fn priority(&self) -> i32 {
        self.0.priority
    }

    pub fn timestamp(&self, kind: TimestampKind) -> SystemTime {
        match kind {
            TimestampKind::Received => self.0.timestamps.received,
            TimestampKind::Stamp => self.0.timestamps.stamp,
        }
    }

    pub fn get_value(&self, name: &str) -> Option<Vec<u8>> {
        self.0.values.read().unwrap().get(name).cloned()
    }

    /// Set a name-value pair. Copy-on-write: if this handle is the sole
    /// owner of the current map, mutates in place; otherwise clones first
    /// so other clones of this `Message` don't observe the change
    /// (messages are meant to be immutable once fanned out).
    pub fn set_value(&self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let mut guard = self.0.values.write().unwrap();
        let map = Arc::make_mut(&mut guard);
        map.insert(name.into(), value.into());
    }

    /// Approximate wire size used for `memory_usage` accounting (§3).
    pub fn size_bytes(&self) -> usize {
        let values_size: usize = self
            .0
            .values
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.0.body.len() + values_size + std::mem::size_of::<MessageInner>()
    }

    /// Register this message's ack group (§6.1 `add_ack`). A message only
    /// has one ack group; attaching a new one replaces the prior
    /// registration (used when a message is pushed into a new queue after
    /// being forked).
    pub fn attach_ack_group(&self, group: AckGroup) {
        group.add_ack();
        *self.0.ack_group.write().unwrap() = Some(group);
    }

    /// Resolve this message's ack (§6.1 `ack`). A no-op if no ack group is
    /// attached (e.g. internal messages that never need acking).
    pub fn ack(&self, status: AckStatus) {
        if let Some(group) = self.0.ack_group.read().unwrap().as_ref() {
            group.ack(status);
        }
    }

    /// Strong-count of the backing `Arc` — diagnostic use only.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

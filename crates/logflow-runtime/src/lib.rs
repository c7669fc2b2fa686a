//! Scheduler/main loop (C1), worker pool & thread registry (C2), and the
//! deferred-timer coalescer (C5).

pub mod coalescer;
pub mod mainloop;
pub mod timer;
pub mod worker;

pub use coalescer::BatchedTimer;
pub use mainloop::{FdSource, MainLoop, MainLoopHandle, ShutdownPhase};
pub use timer::{TimerCallback, TimerHeap, TimerId};
pub use worker::{current_worker_index, JobGuard, WorkerPool};

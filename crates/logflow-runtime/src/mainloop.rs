//! The scheduler / reactor main loop (§4.1 / C1).
//!
//! A single thread owns: readiness polling over registered fds, the
//! timer heap, and a cross-thread task queue (`call_on_main`, a
//! TLS-latch/condvar handshake for running a closure on the reactor
//! thread and optionally blocking the caller until it finishes). Fd
//! readiness uses `nix::poll` plus a self-pipe, the idiomatic way to get
//! a pollable cross-thread wakeup source in plain Rust.
//!
//! SIGHUP/SIGTERM are caught with the same self-pipe trick: the signal
//! handler only sets an atomic flag and writes one byte to the pipe,
//! deferring all real work to the main loop thread.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{pipe, read, write};

use crate::timer::{TimerCallback, TimerHeap, TimerId};

/// A readiness-based collaborator the main loop polls every iteration.
pub trait FdSource: Send + Sync {
    fn fd(&self) -> RawFd;
    fn interest(&self) -> PollFlags;
    /// Called from the main loop thread when `interest` conditions
    /// matched. `revents` is the actual mask returned by `poll`.
    fn on_ready(&self, revents: PollFlags);
}

const REASON_WAKE: u8 = 0;
const REASON_SIGHUP: u8 = 1;
const REASON_SIGTERM: u8 = 2;

static SELF_PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static RELOAD_PENDING: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_SIGNALS_RECEIVED: AtomicU8 = AtomicU8::new(0);

extern "C" fn handle_sighup(_: i32) {
    RELOAD_PENDING.store(true, Ordering::Release);
    wake_self_pipe(REASON_SIGHUP);
}

extern "C" fn handle_sigterm(_: i32) {
    SHUTDOWN_SIGNALS_RECEIVED.fetch_add(1, Ordering::AcqRel);
    wake_self_pipe(REASON_SIGTERM);
}

fn wake_self_pipe(reason: u8) {
    let fd = SELF_PIPE_WRITE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        let buf = [reason];
        // Best-effort; a pipe full of unread wake bytes still wakes poll().
        let _ = write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &buf);
    }
}

struct Task {
    body: Box<dyn FnOnce() + Send>,
    done: Arc<(Mutex<bool>, Condvar)>,
}

/// Two-phase shutdown signal delivered to whatever registered the
/// shutdown callback (§4.1). `Graceful` asks for queues to be drained
/// and destinations flushed before exiting; `Force` means a second
/// SIGTERM arrived and the caller should abandon in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Graceful,
    Force,
}

type ReloadHandler = Box<dyn FnMut() + Send>;
type ShutdownHandler = Box<dyn FnMut(ShutdownPhase) + Send>;

struct Shared {
    timers: TimerHeap,
    tasks: Mutex<VecDeque<Task>>,
    fd_sources: Mutex<Vec<Arc<dyn FdSource>>>,
    running: AtomicBool,
    main_thread: OnceLock<ThreadId>,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    reload_handler: Mutex<Option<ReloadHandler>>,
    shutdown_handler: Mutex<Option<ShutdownHandler>>,
}

/// The reactor itself. Create one per process; `run()` blocks the
/// calling thread and becomes "the main thread" for `call_on_main`
/// purposes.
pub struct MainLoop {
    shared: Arc<Shared>,
}

/// A cheap, cloneable handle other threads use to reach the main loop
/// (`call_on_main`, timer registration) without holding a reference to
/// the `MainLoop` itself.
#[derive(Clone)]
pub struct MainLoopHandle {
    shared: Arc<Shared>,
}

impl MainLoop {
    pub fn new() -> std::io::Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        nix::fcntl::fcntl(
            &read_fd,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .map_err(std::io::Error::from)?;

        Ok(Self {
            shared: Arc::new(Shared {
                timers: TimerHeap::new(),
                tasks: Mutex::new(VecDeque::new()),
                fd_sources: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                main_thread: OnceLock::new(),
                wake_read: read_fd,
                wake_write: write_fd,
                reload_handler: Mutex::new(None),
                shutdown_handler: Mutex::new(None),
            }),
        })
    }

    pub fn handle(&self) -> MainLoopHandle {
        MainLoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Install SIGHUP/SIGTERM handlers that wake this main loop (§4.1
    /// reload/shutdown semantics). Safe to call once per process; not
    /// undone on drop, since ownership of these signals is meant to last
    /// for the process's whole lifetime.
    ///
    /// # Safety
    /// Installs a process-wide signal handler. Must not be called
    /// concurrently with other code that installs SIGHUP/SIGTERM
    /// handlers.
    pub unsafe fn install_signal_handlers(&self) {
        SELF_PIPE_WRITE_FD.store(self.shared.wake_write.as_raw_fd(), Ordering::Release);
        let _ = signal::signal(Signal::SIGHUP, SigHandler::Handler(handle_sighup));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_sigterm));
    }

    pub fn on_reload(&self, handler: impl FnMut() + Send + 'static) {
        *self.shared.reload_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn on_shutdown(&self, handler: impl FnMut(ShutdownPhase) + Send + 'static) {
        *self.shared.shutdown_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn register_fd_source(&self, source: Arc<dyn FdSource>) {
        self.shared.fd_sources.lock().unwrap().push(source);
    }

    /// Run the reactor loop until `stop()` is called or a forced
    /// shutdown phase completes. Must be called from the thread that
    /// should be considered "the main thread" for `call_on_main`.
    pub fn run(&self) {
        self.shared
            .main_thread
            .set(std::thread::current().id())
            .expect("MainLoop::run called more than once");
        self.shared.running.store(true, Ordering::Release);

        let mut wake_buf = [0u8; 64];
        while self.shared.running.load(Ordering::Acquire) {
            let timeout = self
                .shared
                .timers
                .time_until_next()
                .map(duration_to_poll_timeout)
                .unwrap_or(PollTimeout::NONE);

            let sources = self.shared.fd_sources.lock().unwrap().clone();
            let mut pollfds: Vec<PollFd> = Vec::with_capacity(sources.len() + 1);
            pollfds.push(PollFd::new(self.shared.wake_read.as_fd(), PollFlags::POLLIN));
            for src in &sources {
                pollfds.push(PollFd::new(
                    unsafe { std::os::fd::BorrowedFd::borrow_raw(src.fd()) },
                    src.interest(),
                ));
            }

            let _ = poll(&mut pollfds, timeout);

            if let Some(revents) = pollfds[0].revents() {
                if revents.contains(PollFlags::POLLIN) {
                    while read(&self.shared.wake_read, &mut wake_buf)
                        .map(|n| n > 0)
                        .unwrap_or(false)
                    {}
                    self.drain_signals();
                    self.drain_tasks();
                }
            }

            for (src, pfd) in sources.iter().zip(pollfds.iter().skip(1)) {
                if let Some(revents) = pfd.revents() {
                    if !revents.is_empty() {
                        src.on_ready(revents);
                    }
                }
            }

            let due = self.shared.timers.pop_due(Instant::now());
            for cb in due {
                cb();
            }
        }
    }

    fn drain_signals(&self) {
        if RELOAD_PENDING.swap(false, Ordering::AcqRel) {
            if let Some(handler) = self.shared.reload_handler.lock().unwrap().as_mut() {
                handler();
            }
        }

        let signals = SHUTDOWN_SIGNALS_RECEIVED.load(Ordering::Acquire);
        if signals == 1 {
            if let Some(handler) = self.shared.shutdown_handler.lock().unwrap().as_mut() {
                handler(ShutdownPhase::Graceful);
            }
        } else if signals >= 2 {
            if let Some(handler) = self.shared.shutdown_handler.lock().unwrap().as_mut() {
                handler(ShutdownPhase::Force);
            }
            self.stop();
        }
    }

    fn drain_tasks(&self) {
        let tasks: Vec<Task> = {
            let mut queue = self.shared.tasks.lock().unwrap();
            queue.drain(..).collect()
        };
        for task in tasks {
            (task.body)();
            let (lock, cvar) = &*task.done;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        wake_self_pipe(REASON_WAKE);
    }
}

fn duration_to_poll_timeout(d: Duration) -> PollTimeout {
    let millis = d.as_millis().min(i32::MAX as u128) as i32;
    PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
}

impl MainLoopHandle {
    /// Run `f` on the main loop thread (§4.1 `call_on_main`). If already
    /// on the main thread, calls inline. Otherwise posts the closure and
    /// wakes the reactor; if `block` is set, waits for it to finish
    /// executing before returning.
    pub fn call_on_main(&self, f: impl FnOnce() + Send + 'static, block: bool) {
        if self.shared.main_thread.get() == Some(&std::thread::current().id()) {
            f();
            return;
        }

        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let task = Task {
            body: Box::new(f),
            done: Arc::clone(&done),
        };
        self.shared.tasks.lock().unwrap().push_back(task);
        wake_self_pipe(REASON_WAKE);

        if block {
            let (lock, cvar) = &*done;
            let mut finished = lock.lock().unwrap();
            while !*finished {
                finished = cvar.wait(finished).unwrap();
            }
        }
    }

    pub fn schedule_at(&self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let id = self.shared.timers.schedule_at(deadline, callback);
        wake_self_pipe(REASON_WAKE);
        id
    }

    pub fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        self.schedule_at(Instant::now() + delay, callback)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.shared.timers.cancel(id)
    }

    pub fn is_main_thread(&self) -> bool {
        self.shared.main_thread.get() == Some(&std::thread::current().id())
    }

    /// Ask the reactor loop to exit after its current iteration.
    pub fn request_stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        wake_self_pipe(REASON_WAKE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn call_on_main_from_other_thread_runs_and_blocks() {
        let main_loop = MainLoop::new().unwrap();
        let handle = main_loop.handle();
        let ran = Arc::new(AtomicUsize::new(0));

        let runner = std::thread::spawn(move || {
            main_loop.run();
        });

        let ran2 = ran.clone();
        handle.call_on_main(
            move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        handle.request_stop();
        runner.join().unwrap();
    }

    #[test]
    fn timer_fires_on_the_main_loop_thread() {
        let main_loop = MainLoop::new().unwrap();
        let handle = main_loop.handle();
        let fired = Arc::new((Mutex::new(false), Condvar::new()));

        let runner = std::thread::spawn(move || {
            main_loop.run();
        });

        let fired2 = Arc::clone(&fired);
        handle.schedule_after(
            Duration::from_millis(10),
            Box::new(move || {
                let (lock, cvar) = &*fired2;
                *lock.lock().unwrap() = true;
                cvar.notify_all();
            }),
        );

        let (lock, cvar) = &*fired;
        let mut done = lock.lock().unwrap();
        while !*done {
            let (guard, timeout) = cvar.wait_timeout(done, Duration::from_secs(2)).unwrap();
            done = guard;
            if timeout.timed_out() {
                break;
            }
        }
        assert!(*done);

        handle.request_stop();
        runner.join().unwrap();
    }
}

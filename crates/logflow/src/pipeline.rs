//! `Pipeline`: wires C1–C5 together behind a thin, owning entry point
//! over a cluster of single-responsibility crates.
//!
//! One `Pipeline` owns one destination: a [`Queue`], `worker_count()`
//! [`DestWorker`]s draining it, a top-level [`MainLoop`] that carries
//! signal handling and the control socket, and the shared metrics/persist
//! collaborators. This resolves the "library deinit ordering" open
//! question (§9): a `Pipeline` is single-process-lifetime and `shutdown`
//! joins every worker thread before returning, so there is no window
//! where a worker can touch state the facade has already torn down.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use logflow_core::{ConfigProvider, MetricsSink, Message, PathOptions, PersistStore, Transport};
use logflow_dest::{DestWorker, DestWorkerConfig};
use logflow_queue::{Queue, QueueNode};
use logflow_runtime::{MainLoop, MainLoopHandle, WorkerPool};

use crate::control::{ControlCommand, ControlHandler, ControlSocket};
use crate::mark::MarkGenerator;
use crate::metrics::AtomicMetricsSink;

pub struct Pipeline {
    driver_name: String,
    queue: Arc<Queue>,
    workers: Vec<DestWorker>,
    worker_pool: Arc<WorkerPool>,
    main_loop: Mutex<Option<MainLoop>>,
    main_loop_handle: MainLoopHandle,
    main_thread: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<AtomicMetricsSink>,
    mark_generator: MarkGenerator,
    exit_code: AtomicI32,
}

impl Pipeline {
    /// Build the queue and spawn every destination worker. `transport_for`
    /// is called once per worker index so drivers that need a dedicated
    /// connection per worker (the common case) get one; a driver that's
    /// fine sharing one connection can just clone the same `Arc` for
    /// every index.
    pub fn new(
        driver_name: impl Into<String>,
        config: &dyn ConfigProvider,
        transport_for: impl Fn(usize) -> Arc<dyn Transport>,
        metrics: Arc<AtomicMetricsSink>,
        persist: Option<Arc<dyn PersistStore>>,
    ) -> std::io::Result<Arc<Self>> {
        let driver_name = driver_name.into();
        let metrics_sink: Arc<dyn MetricsSink> = metrics.clone();
        let queue = Arc::new(
            Queue::with_metrics(config.queue_capacity(), driver_name.clone(), Some(metrics_sink))
                .with_backlog(config.use_backlog())
                .with_throttle(config.throttle_limit().unwrap_or(0)),
        );

        let worker_count = config.worker_count().max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_config = DestWorkerConfig {
                driver_name: driver_name.clone(),
                worker_index: index,
                batch_lines: config.batch_size(),
                batch_timeout: config.batch_timeout(),
                t_reopen: config.reopen_timeout(),
                max_retries: config.max_retries(),
                max_retries_on_error: config.max_retries_on_error(),
            };
            let worker = DestWorker::spawn(
                worker_config,
                Arc::clone(&queue),
                transport_for(index),
                Some(metrics.clone() as Arc<dyn MetricsSink>),
                persist.clone(),
            )?;
            workers.push(worker);
        }

        let main_loop = MainLoop::new()?;
        let main_loop_handle = main_loop.handle();

        let mark_generator = MarkGenerator::new(
            main_loop_handle.clone(),
            driver_name.clone(),
            config.mark_mode(),
            config.mark_interval(),
            Arc::clone(&queue),
        );

        Ok(Arc::new(Self {
            driver_name,
            queue,
            workers,
            worker_pool: Arc::new(WorkerPool::new()),
            main_loop: Mutex::new(Some(main_loop)),
            main_loop_handle,
            main_thread: Mutex::new(None),
            metrics,
            mark_generator,
            exit_code: AtomicI32::new(0),
        }))
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }

    pub fn metrics(&self) -> &Arc<AtomicMetricsSink> {
        &self.metrics
    }

    /// Push one message through the slow (always-locked) path. Fine for
    /// occasional or unregistered callers (demos, tests, a one-off control
    /// command); a dedicated source thread doing sustained pushes should
    /// use `spawn_producer` instead, which registers it with the worker
    /// pool so it gets the lock-free fast path (§4.3).
    pub fn push(&self, message: Message, path_options: PathOptions) -> logflow_queue::PushOutcome {
        self.mark_generator.touch();
        self.queue.push_tail_slow(QueueNode::new(message, path_options))
    }

    /// Spawn a dedicated producer thread registered with the pipeline's
    /// `WorkerPool`, giving it a stable thread index so its pushes go
    /// through `Queue::push_tail_fast` instead of the always-locked
    /// `push_tail_slow` (§4.3 — "locking on every push would cap
    /// throughput"). `body` receives a `Producer` scoped to that index;
    /// returns `None` if the pool is already at its hard cap of
    /// `WorkerPool::max_threads()` registered producers/workers.
    pub fn spawn_producer<F>(self: &Arc<Self>, name: impl Into<String>, body: F) -> Option<()>
    where
        F: FnOnce(Producer) + Send + 'static,
    {
        let queue = Arc::clone(&self.queue);
        let pipeline = Arc::clone(self);
        self.worker_pool
            .spawn(name, move |thread_id, worker_pool| {
                body(Producer {
                    queue,
                    worker_pool,
                    pipeline,
                    thread_id,
                });
            })
            .map(|_| ())
    }

    /// Start the top-level reactor on a dedicated thread: registers the
    /// control socket (if a path is given) and, optionally, SIGHUP/SIGTERM
    /// handlers, then runs until `shutdown()` or a `stop` control command.
    ///
    /// # Safety requirement
    /// `install_signal_handlers` installs process-wide signal handlers
    /// (see [`MainLoop::install_signal_handlers`]); only one `Pipeline`
    /// per process should set this, and never concurrently with other
    /// code installing SIGHUP/SIGTERM handlers.
    pub fn start(
        self: &Arc<Self>,
        control_socket_path: Option<PathBuf>,
        install_signal_handlers: bool,
    ) -> std::io::Result<()> {
        let main_loop = self
            .main_loop
            .lock()
            .unwrap()
            .take()
            .expect("Pipeline::start called more than once");

        if let Some(path) = control_socket_path {
            let handler: Arc<dyn ControlHandler> = Arc::clone(self) as Arc<dyn ControlHandler>;
            let socket = ControlSocket::bind(path, handler)?;
            main_loop.register_fd_source(Arc::new(socket));
        }

        if install_signal_handlers {
            // SAFETY: caller's contract, documented above.
            unsafe { main_loop.install_signal_handlers() };
        }

        let shutdown_self = Arc::clone(self);
        main_loop.on_shutdown(move |phase| {
            tracing::info!(driver = %shutdown_self.driver_name, ?phase, "shutdown signal observed");
            shutdown_self.shutdown_workers();
        });

        let reload_self = Arc::clone(self);
        main_loop.on_reload(move || {
            reload_self.worker_pool.quiesce(|| {
                tracing::info!(driver = %reload_self.driver_name, "reload barrier crossed");
            });
        });

        let handle = std::thread::Builder::new()
            .name(format!("logflow-main-{}", self.driver_name))
            .spawn(move || main_loop.run())?;
        *self.main_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn shutdown_workers(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
        for worker in &self.workers {
            worker.join();
        }
    }

    /// Tear the whole pipeline down: every destination worker is asked
    /// to flush/rewind/disconnect and joined, then the top-level reactor
    /// (if started) is stopped and joined. A `Pipeline` is not reusable
    /// after this (§9 Open Question: library deinit ordering).
    pub fn shutdown(&self) {
        self.shutdown_workers();
        self.main_loop_handle.request_stop();
        if let Some(handle) = self.main_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }
}

/// A producer thread registered with a `Pipeline`'s `WorkerPool` (§4.2):
/// carries the stable thread index that lets `push` use `Queue`'s
/// lock-free `input[T]` slot instead of the always-locked `wait` list.
/// Obtained from `Pipeline::spawn_producer`.
pub struct Producer {
    queue: Arc<Queue>,
    worker_pool: Arc<WorkerPool>,
    pipeline: Arc<Pipeline>,
    thread_id: usize,
}

impl Producer {
    /// Push through the per-thread fast path (§4.3 `push_tail_fast`). On
    /// the first push since the last flush, registers an end-of-batch
    /// callback with the worker pool so `end_batch` (or any other caller
    /// of `WorkerPool::invoke_batch_callbacks` on this thread) flushes the
    /// staged input into `wait` exactly once per batch.
    pub fn push(&self, message: Message, path_options: PathOptions) -> logflow_queue::PushOutcome {
        self.pipeline.mark_generator.touch();
        let outcome = self
            .queue
            .push_tail_fast(self.thread_id, QueueNode::new(message, path_options));
        if outcome == logflow_queue::PushOutcome::AcceptedFirstInBatch {
            let queue = Arc::clone(&self.queue);
            let thread_id = self.thread_id;
            self.worker_pool
                .register_batch_callback(move || queue.flush_input(thread_id));
        }
        outcome
    }

    /// Run (and clear) every end-of-batch callback registered by this
    /// thread so far, flushing any staged input into `wait` (§4.2). Call
    /// this once per logical batch of reads (e.g. after draining a
    /// socket's worth of datagrams) rather than after every single push.
    pub fn end_batch(&self) {
        self.worker_pool.invoke_batch_callbacks();
    }
}

impl ControlHandler for Pipeline {
    fn handle(&self, command: ControlCommand) -> String {
        match command {
            ControlCommand::Reload => {
                self.worker_pool.quiesce(|| {
                    tracing::info!(driver = %self.driver_name, "reload barrier crossed");
                });
                "OK reload".to_string()
            }
            ControlCommand::Reopen => {
                for worker in &self.workers {
                    worker.request_reopen();
                }
                "OK reopen".to_string()
            }
            ControlCommand::Stop => {
                self.exit_code.store(0, Ordering::Release);
                self.shutdown_workers();
                self.main_loop_handle.request_stop();
                "OK stop".to_string()
            }
            ControlCommand::StatsDump => self.metrics.render_stats_dump(),
            ControlCommand::VerifyConfig => "OK verify-config".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use crate::metrics::AtomicMetricsSink;
    use logflow_core::Tag;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    struct CountingTransport {
        accepted: AtomicU64,
    }

    impl Transport for CountingTransport {
        fn name(&self) -> &str {
            "counting"
        }
        fn connect(&self) -> std::result::Result<(), crate::TransportResult> {
            Ok(())
        }
        fn disconnect(&self) {}
        fn insert(&self, _message: &Message) -> crate::TransportResult {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            crate::TransportResult::Success
        }
        fn flush(&self) -> crate::TransportResult {
            crate::TransportResult::Success
        }
    }

    /// A registered producer's pushes must reach the destination exactly
    /// like `Pipeline::push`'s slow path does — this is the only thing
    /// that tells `push_tail_fast`/`flush_input` apart from dead code.
    #[test]
    fn spawn_producer_pushes_reach_the_destination() {
        let sink = Arc::new(CountingTransport {
            accepted: AtomicU64::new(0),
        });
        let mut cfg = StaticConfig::default();
        cfg.worker_count = 1;
        cfg.queue_capacity = 1_000;

        let metrics = Arc::new(AtomicMetricsSink::new());
        let sink_for_pipeline = Arc::clone(&sink);
        let pipeline = Pipeline::new(
            "producer-test",
            &cfg,
            move |_| sink_for_pipeline.clone() as Arc<dyn Transport>,
            metrics.clone(),
            None,
        )
        .unwrap();

        pipeline
            .spawn_producer("test-producer", move |handle| {
                for i in 0..50 {
                    handle.push(
                        Message::new(format!("m{i}").into_bytes(), Tag::empty(), 6),
                        PathOptions::default(),
                    );
                }
                handle.end_batch();
            })
            .expect("producer slot available");
        pipeline.worker_pool().join_all();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while metrics.processed("producer-test") < 50 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        pipeline.shutdown();

        assert_eq!(metrics.processed("producer-test"), 50);
        assert_eq!(sink.accepted.load(Ordering::Relaxed), 50);
    }
}

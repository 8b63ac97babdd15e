//! Top-level lifecycle: build the worker pool, bootstrap the statically
//! configured services, stop, and join.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};
use mio::{Poll, Waker};
use tracing::{error, info};

use crate::config::{NodeConfig, ServiceConfig};
use crate::error::Error;
use crate::metrics::StatsCollector;
use crate::router::{Router, WorkerHandle};
use crate::service::{Actor, ActorFactory};
use crate::worker::{WAKER_TOKEN, Worker, WorkerInput};

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerBuilder {
    node: NodeConfig,
    types: HashMap<String, ActorFactory>,
    stats_interval: Option<Duration>,
}

impl ServerBuilder {
    pub fn new(node: NodeConfig) -> Self {
        Self {
            node,
            types: HashMap::new(),
            stats_interval: Some(Duration::from_secs(60)),
        }
    }

    /// Register a service type; configs resolve to it through their `file`
    /// stem.
    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&ServiceConfig) -> Result<Box<dyn Actor>, Error> + Send + Sync + 'static,
    {
        self.types.insert(name.to_string(), Box::new(factory));
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = Some(interval);
        self
    }

    pub fn no_stats(mut self) -> Self {
        self.stats_interval = None;
        self
    }

    /// Create the pollers, channels, and worker threads. Services are not
    /// created yet; call `Server::bootstrap` (or `run`) next.
    pub fn build(self) -> Result<Server, Error> {
        let num_workers = self.node.thread.clamp(1, u8::MAX as usize);

        let mut handles = Vec::with_capacity(num_workers);
        let mut loops = Vec::with_capacity(num_workers);
        for id in 1..=num_workers as u8 {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            let (tx, rx) = unbounded();
            handles.push(WorkerHandle { id, sender: tx, waker });
            loops.push((id, poll, rx));
        }

        let router = Arc::new(Router::new(handles, self.types));
        router.set_env("sid", &self.node.sid.to_string());
        router.set_env("name", &self.node.name);
        router.set_env("thread", &num_workers.to_string());

        let stats_interval = self.stats_interval.unwrap_or(Duration::from_secs(60));
        let (stats_tx, collector) = match self.stats_interval {
            Some(interval) => {
                let (tx, rx) = bounded(num_workers * 2);
                let collector = StatsCollector::new(rx, num_workers, interval);
                let thread = std::thread::Builder::new()
                    .name("stats-collector".to_string())
                    .spawn(move || collector.run())?;
                (Some(tx), Some(thread))
            }
            None => (None, None),
        };

        let mut workers = Vec::with_capacity(num_workers);
        for (id, poll, rx) in loops {
            let router = Arc::clone(&router);
            let stats_tx = stats_tx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || match Worker::new(id, poll, rx, router, stats_tx, stats_interval) {
                    Ok(mut worker) => worker.run(),
                    Err(e) => error!("worker {id} failed to initialize: {e}"),
                })?;
            workers.push(thread);
        }

        info!(
            "node {} '{}': {} workers up",
            self.node.sid, self.node.name, num_workers
        );

        Ok(Server {
            node: self.node,
            router,
            workers,
            collector,
        })
    }
}

pub struct Server {
    node: NodeConfig,
    router: Arc<Router>,
    workers: Vec<JoinHandle<()>>,
    collector: Option<JoinHandle<()>>,
}

impl Server {
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Construct the statically configured services, round-robin across
    /// workers, then release the start callbacks. Construction completes on
    /// every worker before any `start` runs, so unique names registered by
    /// the initial batch are resolvable from `start`. A failure here is
    /// fatal: the server stops with a non-zero exit code.
    pub fn bootstrap(&self) -> Result<(), Error> {
        let num_workers = self.router.worker_count();
        let mut batches: Vec<Vec<ServiceConfig>> = vec![Vec::new(); num_workers];
        for (i, conf) in self.node.services.iter().enumerate() {
            batches[i % num_workers].push(conf.clone());
        }

        let (ack_tx, ack_rx) = bounded(num_workers);
        for (i, services) in batches.into_iter().enumerate() {
            let posted = self.router.post_to(
                i as u8 + 1,
                WorkerInput::Bootstrap { services, ack: ack_tx.clone() },
            );
            if !posted {
                self.router.stop(1);
                return Err(Error::WorkerUnavailable(i as u8 + 1));
            }
        }
        drop(ack_tx);

        for _ in 0..num_workers {
            match ack_rx.recv_timeout(BOOTSTRAP_TIMEOUT) {
                Ok(Ok(())) => {}
                Ok(Err(text)) => {
                    error!("bootstrap failed: {text}");
                    self.router.stop(1);
                    return Err(Error::Config(text));
                }
                Err(_) => {
                    self.router.stop(1);
                    return Err(Error::Config("bootstrap timed out".to_string()));
                }
            }
        }

        for id in 1..=num_workers as u8 {
            self.router.post_to(id, WorkerInput::StartBatch);
        }
        Ok(())
    }

    /// Request a graceful stop with exit code zero.
    pub fn stop(&self) {
        self.router.stop(0);
    }

    /// Wait for every worker to drain and exit; returns the process exit
    /// code.
    pub fn join(self) -> i32 {
        for worker in self.workers {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
        // Workers dropped their stats senders; the collector drains and
        // exits on disconnect.
        if let Some(collector) = self.collector {
            let _ = collector.join();
        }
        self.router.exit_code()
    }

    /// Bootstrap then block until shutdown.
    pub fn run(self) -> i32 {
        if let Err(e) = self.bootstrap() {
            error!("fatal bootstrap failure: {e}");
            return self.join().max(1);
        }
        self.join()
    }
}

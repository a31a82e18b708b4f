use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use derivative::Derivative;
use tokio::sync::{Mutex, OnceCell};

use crate::{
    config::{MediaConfig, WorkerConfig},
    error::{Error, RouterErrorKind},
    producer::Producer,
    router::Router,
    rtp_parameters::RtpCapabilities,
    worker::Worker,
};

/// Called with the reason once the worker died and the grace period elapsed.
pub type FatalHandler = Arc<dyn Fn(String) + Send + Sync>;

/// The process-wide worker. It is created on first use and shared by every room.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SharedWorker {
    config: WorkerConfig,
    cell: OnceCell<Arc<Worker>>,
    #[derivative(Debug = "ignore")]
    on_fatal: FatalHandler,
}

impl SharedWorker {
    /// Worker death terminates the process.
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_fatal_handler(config, |_| std::process::exit(1))
    }

    pub fn with_fatal_handler<F>(config: WorkerConfig, on_fatal: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self {
            config,
            cell: OnceCell::new(),
            on_fatal: Arc::new(on_fatal),
        }
    }

    pub async fn ensure(&self) -> Result<Arc<Worker>, Error> {
        self.cell
            .get_or_try_init(|| async {
                let worker = Worker::new(self.config.clone()).await?;
                self.watch_died(&worker);
                tracing::info!("Worker {} is running", worker.id);
                Ok::<_, Error>(worker)
            })
            .await
            .cloned()
    }

    pub fn get(&self) -> Option<Arc<Worker>> {
        self.cell.get().cloned()
    }

    fn watch_died(&self, worker: &Arc<Worker>) {
        let mut died = worker.subscribe_died();
        let id = worker.id.clone();
        let grace_period = self.config.died_grace_period;
        let on_fatal = self.on_fatal.clone();
        tokio::spawn(async move {
            if let Ok(reason) = died.recv().await {
                tracing::error!(
                    "Worker {} died, exiting in {:?}: {}",
                    id,
                    grace_period,
                    reason
                );
                tokio::time::sleep(grace_period).await;
                on_fatal(reason);
            }
        });
    }
}

/// Media resources of one room: its router and the producers published in it.
#[derive(Debug)]
pub struct Registry {
    worker: Arc<SharedWorker>,
    media_config: MediaConfig,
    router: OnceCell<Arc<Router>>,
    producers: Mutex<Vec<Arc<Producer>>>,
    closed: AtomicBool,
}

impl Registry {
    pub fn new(worker: Arc<SharedWorker>, media_config: MediaConfig) -> Self {
        Self {
            worker,
            media_config,
            router: OnceCell::new(),
            producers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn ensure_worker(&self) -> Result<Arc<Worker>, Error> {
        self.worker.ensure().await
    }

    /// Creates the router on first call. Concurrent callers wait for the
    /// same creation and all receive the same router. A closed registry
    /// never hands out its router again.
    pub async fn ensure_router(&self) -> Result<Arc<Router>, Error> {
        self.ensure_open()?;
        self.router
            .get_or_try_init(|| async {
                let worker = self.ensure_worker().await?;
                let router = worker.create_router(self.media_config.clone()).await?;
                tracing::info!("Router {} is created", router.id);
                Ok::<_, Error>(router)
            })
            .await
            .cloned()
    }

    pub fn router(&self) -> Option<Arc<Router>> {
        if self.closed() {
            return None;
        }
        self.router.get().cloned()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn rtp_capabilities(&self) -> Result<RtpCapabilities, Error> {
        self.ensure_open()?;
        self.router
            .get()
            .map(|router| router.rtp_capabilities().clone())
            .ok_or(Error::new_router(
                "Router has not been created".to_owned(),
                RouterErrorKind::RouterNotCreatedError,
            ))
    }

    pub async fn register_producer(&self, producer: Arc<Producer>) {
        let mut producers = self.producers.lock().await;
        producers.retain(|p| !p.closed());
        producers.push(producer);
    }

    /// The most recently registered producer that is still open.
    pub async fn current_producer(&self) -> Option<Arc<Producer>> {
        let producers = self.producers.lock().await;
        producers.iter().rev().find(|p| !p.closed()).cloned()
    }

    pub async fn find_producer(&self, producer_id: &str) -> Option<Arc<Producer>> {
        let producers = self.producers.lock().await;
        producers
            .iter()
            .find(|p| p.id == producer_id && !p.closed())
            .cloned()
    }

    pub async fn remove_producer(&self, producer_id: &str) {
        let mut producers = self.producers.lock().await;
        producers.retain(|p| p.id != producer_id);
    }

    pub async fn producer_exists(&self) -> bool {
        self.current_producer().await.is_some()
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.get() {
            router.close().await;
        }
        self.producers.lock().await.clear();
    }

    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.closed() {
            return Err(Error::new_router(
                "Router of this room has been closed".to_owned(),
                RouterErrorKind::RouterClosedError,
            ));
        }
        Ok(())
    }
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;
use webrtc::dtls::crypto::Certificate;

use crate::{
    config::{MediaConfig, WorkerConfig},
    error::{Error, WorkerErrorKind},
    router::Router,
    transport_parameters::DtlsFingerprint,
    utils::ports::PortAllocator,
};

/// Worker is the media engine process of the server. It owns the RTC port
/// range and the DTLS certificate, and manages routers.
#[derive(Debug)]
pub struct Worker {
    pub id: String,
    pub config: WorkerConfig,
    routers: Mutex<HashMap<String, Arc<Router>>>,
    ports: Arc<PortAllocator>,
    fingerprints: Vec<DtlsFingerprint>,
    worker_event_sender: mpsc::UnboundedSender<WorkerEvent>,
    died_sender: broadcast::Sender<String>,
    dead: AtomicBool,
}

impl Worker {
    /// Creates a new worker with the given configuration.
    pub async fn new(config: WorkerConfig) -> Result<Arc<Self>, Error> {
        let fingerprints = generate_fingerprints()?;
        let (tx, rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let (died_sender, _rx) = broadcast::channel(1);
        let id = Uuid::new_v4().to_string();

        let worker = Arc::new(Self {
            id: id.clone(),
            ports: Arc::new(PortAllocator::new(config.port_range)),
            config,
            routers: Mutex::new(HashMap::new()),
            fingerprints,
            worker_event_sender: tx,
            died_sender,
            dead: AtomicBool::new(false),
        });

        {
            let worker = Arc::downgrade(&worker);
            tokio::spawn(async move {
                Self::worker_event_loop(worker, rx).await;
            });
        }

        tracing::debug!("Worker {} is created", id);
        Ok(worker)
    }

    /// Creates a new router and adds it to the worker.
    pub async fn create_router(&self, media_config: MediaConfig) -> Result<Arc<Router>, Error> {
        if self.is_dead() {
            return Err(Error::new_worker(
                format!("Worker {} has died", self.id),
                WorkerErrorKind::WorkerDiedError,
            ));
        }
        let router = Router::new(
            media_config,
            self.ports.clone(),
            self.fingerprints.clone(),
            self.worker_event_sender.clone(),
        )?;
        let mut routers = self.routers.lock().await;
        routers.insert(router.id.clone(), router.clone());
        Ok(router)
    }

    pub async fn router_count(&self) -> usize {
        self.routers.lock().await.len()
    }

    /// Number of RTC ports held by open transports.
    pub fn used_ports(&self) -> usize {
        self.ports.in_use()
    }

    /// Receives the reason once the worker dies.
    pub fn subscribe_died(&self) -> broadcast::Receiver<String> {
        self.died_sender.subscribe()
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Reports that the worker stopped working. Every router is closed.
    pub fn died(&self, reason: String) {
        let _ = self
            .worker_event_sender
            .send(WorkerEvent::Died(reason));
    }

    /// Closes the worker and all of its routers.
    pub async fn close(&self) {
        let routers: Vec<Arc<Router>> = {
            let mut routers = self.routers.lock().await;
            routers.drain().map(|(_, router)| router).collect()
        };
        for router in routers {
            router.close().await;
        }
    }

    pub(crate) async fn worker_event_loop(
        worker: Weak<Worker>,
        mut event_receiver: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        while let Some(event) = event_receiver.recv().await {
            let Some(worker) = worker.upgrade() else {
                break;
            };
            match event {
                WorkerEvent::RouterRemoved(router_id) => {
                    let mut routers = worker.routers.lock().await;
                    routers.remove(&router_id);
                }
                WorkerEvent::Died(reason) => {
                    if worker.dead.swap(true, Ordering::SeqCst) {
                        continue;
                    }
                    tracing::error!("Worker {} died: {}", worker.id, reason);
                    worker.close().await;
                    let _ = worker.died_sender.send(reason);
                }
            }
        }
        tracing::debug!("Worker event loop finished");
    }
}

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    RouterRemoved(String),
    Died(String),
}

impl Drop for Worker {
    fn drop(&mut self) {
        tracing::debug!("Worker {} is dropped", self.id);
    }
}

fn generate_fingerprints() -> Result<Vec<DtlsFingerprint>, Error> {
    let certificate = Certificate::generate_self_signed(vec!["vcroom".to_owned()])
        .map_err(|err| Error::new_worker(err.to_string(), WorkerErrorKind::CertificateError))?;
    let der = certificate.certificate.first().ok_or(Error::new_worker(
        "Generated certificate is empty".to_owned(),
        WorkerErrorKind::CertificateError,
    ))?;
    let digest = Sha256::digest(der.as_ref());
    let value = digest
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<String>>()
        .join(":");
    Ok(vec![DtlsFingerprint {
        algorithm: "sha-256".to_owned(),
        value,
    }])
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::{
    config::{MediaConfig, WebRTCTransportConfig},
    error::{Error, ProducerErrorKind, RouterErrorKind},
    ortc,
    producer::Producer,
    rtp_parameters::RtpCapabilities,
    transport_parameters::DtlsFingerprint,
    utils::ports::PortAllocator,
    webrtc_transport::WebRtcTransport,
    worker::WorkerEvent,
};

/// Router accommodates multiple transports and they can communicate with each other. That means transports belonging to the same Router can send/receive their media. Router is like a meeting room.
#[derive(Debug)]
pub struct Router {
    pub id: String,
    rtp_capabilities: RtpCapabilities,
    transports: Mutex<Vec<Weak<WebRtcTransport>>>,
    router_event_sender: mpsc::UnboundedSender<RouterEvent>,
    ports: Arc<PortAllocator>,
    fingerprints: Vec<DtlsFingerprint>,
    closed: AtomicBool,
}

impl Router {
    pub(crate) fn new(
        media_config: MediaConfig,
        ports: Arc<PortAllocator>,
        fingerprints: Vec<DtlsFingerprint>,
        worker_event_sender: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Arc<Router>, Error> {
        let rtp_capabilities = ortc::generate_router_rtp_capabilities(&media_config.media_codecs)?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel::<RouterEvent>();

        let router = Router {
            id: id.clone(),
            rtp_capabilities,
            transports: Mutex::new(Vec::new()),
            router_event_sender: tx,
            ports,
            fingerprints,
            closed: AtomicBool::new(false),
        };

        tracing::debug!("Router {} is created", id);

        {
            let id = id.clone();
            tokio::spawn(async move {
                Router::router_event_loop(id, worker_event_sender, rx).await;
            });
        }

        Ok(Arc::new(router))
    }

    /// Codecs and header extensions this router can route. Clients load their device with these.
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn create_webrtc_transport(
        &self,
        transport_config: &WebRTCTransportConfig,
    ) -> Result<Arc<WebRtcTransport>, Error> {
        if self.closed() {
            return Err(Error::new_router(
                format!("Router {} is closed", self.id),
                RouterErrorKind::RouterClosedError,
            ));
        }
        let transport = WebRtcTransport::new(
            transport_config,
            self.ports.clone(),
            self.fingerprints.clone(),
            self.rtp_capabilities.clone(),
            self.router_event_sender.clone(),
        )?;

        let mut transports = self.transports.lock().await;
        transports.retain(|transport| transport.strong_count() > 0);
        transports.push(Arc::downgrade(&transport));
        Ok(transport)
    }

    /// Looks up a live producer of this router.
    pub async fn get_producer(&self, producer_id: &str) -> Result<Arc<Producer>, Error> {
        Self::find_producer(&self.router_event_sender, producer_id.to_owned()).await
    }

    /// Whether an endpoint with `rtp_capabilities` can receive the given producer.
    /// An unknown producer can not be consumed.
    pub async fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        match self.get_producer(producer_id).await {
            Ok(producer) => ortc::can_consume(producer.consumable_rtp_parameters(), rtp_capabilities),
            Err(err) => {
                tracing::error!("can_consume() failed for producer {}: {}", producer_id, err);
                false
            }
        }
    }

    pub(crate) async fn router_event_loop(
        id: String,
        worker_event_sender: mpsc::UnboundedSender<WorkerEvent>,
        mut event_receiver: mpsc::UnboundedReceiver<RouterEvent>,
    ) {
        tracing::debug!("Router {} event loop started", id);
        let mut producers: HashMap<String, Weak<Producer>> = HashMap::new();
        while let Some(event) = event_receiver.recv().await {
            match event {
                RouterEvent::ProducerAdded(producer_id, producer) => {
                    producers.insert(producer_id, producer);
                }
                RouterEvent::ProducerRemoved(producer_id) => {
                    producers.remove(&producer_id);
                }
                RouterEvent::GetProducer(producer_id, reply_sender) => {
                    let producer = producers
                        .get(&producer_id)
                        .and_then(|producer| producer.upgrade())
                        .filter(|producer| !producer.closed());
                    let _ = reply_sender.send(producer);
                }
                RouterEvent::Closed => {
                    if let Err(err) = worker_event_sender.send(WorkerEvent::RouterRemoved(id.clone()))
                    {
                        tracing::error!("Failed to send RouterRemoved event id={}: {}", id, err);
                    }
                    break;
                }
            }
        }
        tracing::debug!("Router {} event loop finished", id);
    }

    pub(crate) async fn find_producer(
        event_sender: &mpsc::UnboundedSender<RouterEvent>,
        producer_id: String,
    ) -> Result<Arc<Producer>, Error> {
        let (tx, rx) = oneshot::channel();

        event_sender
            .send(RouterEvent::GetProducer(producer_id.clone(), tx))
            .map_err(|_| {
                Error::new_router("Router is closed".to_owned(), RouterErrorKind::RouterClosedError)
            })?;

        let reply = rx.await.map_err(|_| {
            Error::new_router("Router is closed".to_owned(), RouterErrorKind::RouterClosedError)
        })?;
        match reply {
            None => Err(Error::new_producer(
                format!("Producer {} is not found", producer_id),
                ProducerErrorKind::ProducerNotFoundError,
            )),
            Some(producer) => Ok(producer),
        }
    }

    /// Closes every transport of this router and removes it from its worker.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports: Vec<Arc<WebRtcTransport>> = {
            let mut transports = self.transports.lock().await;
            transports.drain(..).filter_map(|t| t.upgrade()).collect()
        };
        for transport in transports {
            transport.close().await;
        }
        let _ = self.router_event_sender.send(RouterEvent::Closed);
    }
}

#[derive(Debug)]
pub(crate) enum RouterEvent {
    ProducerAdded(String, Weak<Producer>),
    ProducerRemoved(String),
    GetProducer(String, oneshot::Sender<Option<Arc<Producer>>>),
    Closed,
}

impl Drop for Router {
    fn drop(&mut self) {
        tracing::debug!("Router {} is dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::WorkerConfig,
        error::{ErrorKind, TransportErrorKind},
        worker::Worker,
    };

    #[tokio::test]
    async fn unknown_producer() {
        let worker = Worker::new(WorkerConfig::default()).await.unwrap();
        let router = worker.create_router(MediaConfig::default()).await.unwrap();

        let err = router.get_producer("missing").await.unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::ProducerError(ProducerErrorKind::ProducerNotFoundError)
        );
        assert!(
            !router
                .can_consume("missing", router.rtp_capabilities())
                .await
        );
    }

    #[tokio::test]
    async fn transport_requires_a_protocol() {
        let worker = Worker::new(WorkerConfig::default()).await.unwrap();
        let router = worker.create_router(MediaConfig::default()).await.unwrap();

        let mut config = WebRTCTransportConfig::default();
        config.enable_udp = false;
        config.enable_tcp = false;
        let err = router.create_webrtc_transport(&config).await.unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::TransportError(TransportErrorKind::InvalidListenIpsError)
        );
    }

    #[tokio::test]
    async fn close_closes_transports() {
        let worker = Worker::new(WorkerConfig::default()).await.unwrap();
        let router = worker.create_router(MediaConfig::default()).await.unwrap();
        let transport = router
            .create_webrtc_transport(&WebRTCTransportConfig::default())
            .await
            .unwrap();

        router.close().await;
        assert!(transport.closed());

        let err = router
            .create_webrtc_transport(&WebRTCTransportConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RouterError(RouterErrorKind::RouterClosedError));
    }
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};

use serde_json::Value;
use strum_macros::Display;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;
use webrtc::ice::rand::{generate_pwd, generate_ufrag};

use crate::{
    config::WebRTCTransportConfig,
    consumer::Consumer,
    error::{ConsumerErrorKind, Error, TransportErrorKind},
    ortc,
    producer::Producer,
    router::{Router, RouterEvent},
    rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters},
    transport_parameters::{
        DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceCandidateTcpType,
        IceCandidateType, IceParameters, IceState, Protocol, SctpParameters,
    },
    utils::ports::PortAllocator,
};

const UDP_PREFERENCE: u32 = 65535;
const TCP_PREFERENCE: u32 = 32767;

/// Options of [`WebRtcTransport::produce`].
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: Value,
}

/// Options of [`WebRtcTransport::consume`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum TransportEvent {
    DtlsStateChange(DtlsState),
    IceStateChange(IceState),
    Close,
}

#[derive(Debug)]
struct TransportState {
    dtls_state: DtlsState,
    ice_state: IceState,
    dtls_role: DtlsRole,
    remote_dtls_parameters: Option<DtlsParameters>,
}

/// One client's ICE/DTLS secured path. A transport carries producers, consumers or both.
#[derive(Debug)]
pub struct WebRtcTransport {
    pub id: String,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    fingerprints: Vec<DtlsFingerprint>,
    sctp_parameters: Option<SctpParameters>,
    available_outgoing_bitrate: AtomicU32,
    minimum_available_outgoing_bitrate: u32,
    state: Mutex<TransportState>,
    producers: Mutex<HashMap<String, Arc<Producer>>>,
    consumers: Mutex<HashMap<String, Arc<Consumer>>>,
    next_mid: AtomicUsize,
    ports: Arc<PortAllocator>,
    allocated_ports: Vec<u16>,
    router_rtp_capabilities: RtpCapabilities,
    router_event_sender: mpsc::UnboundedSender<RouterEvent>,
    event_sender: broadcast::Sender<TransportEvent>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    pub(crate) fn new(
        transport_config: &WebRTCTransportConfig,
        ports: Arc<PortAllocator>,
        fingerprints: Vec<DtlsFingerprint>,
        router_rtp_capabilities: RtpCapabilities,
        router_event_sender: mpsc::UnboundedSender<RouterEvent>,
    ) -> Result<Arc<Self>, Error> {
        if transport_config.listen_ips.is_empty() {
            return Err(Error::new_transport(
                "listenIps must not be empty".to_owned(),
                TransportErrorKind::InvalidListenIpsError,
            ));
        }
        if !transport_config.enable_udp && !transport_config.enable_tcp {
            return Err(Error::new_transport(
                "Either UDP or TCP must be enabled".to_owned(),
                TransportErrorKind::InvalidListenIpsError,
            ));
        }

        let mut allocated_ports = Vec::with_capacity(transport_config.listen_ips.len());
        for _ in transport_config.listen_ips.iter() {
            match ports.allocate() {
                Ok(port) => allocated_ports.push(port),
                Err(err) => {
                    for port in allocated_ports {
                        ports.release(port);
                    }
                    return Err(err);
                }
            }
        }

        let udp_preference = if transport_config.prefer_udp {
            UDP_PREFERENCE
        } else {
            TCP_PREFERENCE
        };
        let mut ice_candidates = Vec::new();
        for (index, (listen_ip, port)) in transport_config
            .listen_ips
            .iter()
            .zip(allocated_ports.iter())
            .enumerate()
        {
            let address = listen_ip.announced_ip.unwrap_or(listen_ip.ip);
            let offset = index as u32;
            if transport_config.enable_udp {
                ice_candidates.push(IceCandidate {
                    foundation: "udpcandidate".to_owned(),
                    priority: IceCandidate::priority(udp_preference - offset),
                    address,
                    protocol: Protocol::Udp,
                    port: *port,
                    typ: IceCandidateType::Host,
                    tcp_type: None,
                });
            }
            if transport_config.enable_tcp {
                ice_candidates.push(IceCandidate {
                    foundation: "tcpcandidate".to_owned(),
                    priority: IceCandidate::priority(TCP_PREFERENCE - offset),
                    address,
                    protocol: Protocol::Tcp,
                    port: *port,
                    typ: IceCandidateType::Host,
                    tcp_type: Some(IceCandidateTcpType::Passive),
                });
            }
        }

        let sctp_parameters = transport_config.enable_sctp.then(|| SctpParameters {
            port: 5000,
            os: transport_config.num_sctp_streams.os,
            mis: transport_config.num_sctp_streams.mis,
            max_message_size: transport_config.max_sctp_message_size,
        });

        let (event_sender, _rx) = broadcast::channel(16);
        let id = Uuid::new_v4().to_string();

        let transport = Self {
            id,
            ice_parameters: IceParameters {
                username_fragment: generate_ufrag(),
                password: generate_pwd(),
                ice_lite: true,
            },
            ice_candidates,
            fingerprints,
            sctp_parameters,
            available_outgoing_bitrate: AtomicU32::new(
                transport_config
                    .initial_available_outgoing_bitrate
                    .max(transport_config.minimum_available_outgoing_bitrate),
            ),
            minimum_available_outgoing_bitrate: transport_config.minimum_available_outgoing_bitrate,
            state: Mutex::new(TransportState {
                dtls_state: DtlsState::New,
                ice_state: IceState::New,
                dtls_role: DtlsRole::Auto,
                remote_dtls_parameters: None,
            }),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            next_mid: AtomicUsize::new(0),
            ports,
            allocated_ports,
            router_rtp_capabilities,
            router_event_sender,
            event_sender,
            closed: AtomicBool::new(false),
        };

        tracing::debug!(
            "WebRtcTransport {} is created on ports {:?}",
            transport.id,
            transport.allocated_ports
        );

        Ok(Arc::new(transport))
    }

    pub fn ice_parameters(&self) -> &IceParameters {
        &self.ice_parameters
    }

    pub fn ice_candidates(&self) -> &Vec<IceCandidate> {
        &self.ice_candidates
    }

    /// Outgoing bitrate in bps, never below the configured minimum.
    pub fn available_outgoing_bitrate(&self) -> u32 {
        self.available_outgoing_bitrate.load(Ordering::Relaxed)
    }

    pub fn minimum_available_outgoing_bitrate(&self) -> u32 {
        self.minimum_available_outgoing_bitrate
    }

    /// Applies a new bandwidth estimate.
    pub fn set_available_outgoing_bitrate(&self, bitrate: u32) {
        self.available_outgoing_bitrate.store(
            bitrate.max(self.minimum_available_outgoing_bitrate),
            Ordering::Relaxed,
        );
    }

    /// Local DTLS parameters. The role stays `auto` until the remote side connects.
    pub async fn dtls_parameters(&self) -> DtlsParameters {
        let state = self.state.lock().await;
        DtlsParameters {
            role: state.dtls_role,
            fingerprints: self.fingerprints.clone(),
        }
    }

    pub fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.sctp_parameters
    }

    pub async fn dtls_state(&self) -> DtlsState {
        self.state.lock().await.dtls_state
    }

    pub async fn ice_state(&self) -> IceState {
        self.state.lock().await.ice_state
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_sender.subscribe()
    }

    /// Applies the remote DTLS parameters and completes the handshake.
    pub async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), Error> {
        self.ensure_open()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(Error::new_transport(
                "dtlsParameters.fingerprints must not be empty".to_owned(),
                TransportErrorKind::InvalidDtlsParametersError,
            ));
        }
        {
            let mut state = self.state.lock().await;
            if state.remote_dtls_parameters.is_some() {
                return Err(Error::new_transport(
                    format!("Transport {} is already connected", self.id),
                    TransportErrorKind::AlreadyConnectedError,
                ));
            }
            state.dtls_role = match dtls_parameters.role {
                DtlsRole::Client => DtlsRole::Server,
                DtlsRole::Server | DtlsRole::Auto => DtlsRole::Client,
            };
            state.remote_dtls_parameters = Some(dtls_parameters);
        }

        self.update_ice_state(IceState::Connected).await;
        self.update_dtls_state(DtlsState::Connecting).await;
        self.update_ice_state(IceState::Completed).await;
        self.update_dtls_state(DtlsState::Connected).await;
        Ok(())
    }

    pub async fn update_dtls_state(&self, dtls_state: DtlsState) {
        {
            let mut state = self.state.lock().await;
            if state.dtls_state == dtls_state {
                return;
            }
            state.dtls_state = dtls_state;
        }
        let _ = self
            .event_sender
            .send(TransportEvent::DtlsStateChange(dtls_state));
    }

    pub async fn update_ice_state(&self, ice_state: IceState) {
        {
            let mut state = self.state.lock().await;
            if state.ice_state == ice_state {
                return;
            }
            state.ice_state = ice_state;
        }
        let _ = self
            .event_sender
            .send(TransportEvent::IceStateChange(ice_state));
    }

    pub async fn produce(&self, options: ProducerOptions) -> Result<Arc<Producer>, Error> {
        self.ensure_connected().await?;

        let consumable = ortc::get_consumable_rtp_parameters(
            options.kind,
            &options.rtp_parameters,
            &self.router_rtp_capabilities,
        )?;
        let producer = Producer::new(
            options.kind,
            options.rtp_parameters,
            consumable,
            options.app_data,
            self.router_event_sender.clone(),
        );

        let mut producers = self.producers.lock().await;
        producers.retain(|_, producer| !producer.closed());
        producers.insert(producer.id.clone(), producer.clone());
        Ok(producer)
    }

    pub async fn consume(&self, options: ConsumerOptions) -> Result<Arc<Consumer>, Error> {
        self.ensure_connected().await?;

        let producer =
            Router::find_producer(&self.router_event_sender, options.producer_id.clone()).await?;
        if !ortc::can_consume(producer.consumable_rtp_parameters(), &options.rtp_capabilities) {
            return Err(Error::new_consumer(
                format!("Can not consume producer {}", producer.id),
                ConsumerErrorKind::CapabilityMismatchError,
            ));
        }

        let mut rtp_parameters = ortc::get_consumer_rtp_parameters(
            producer.consumable_rtp_parameters(),
            &options.rtp_capabilities,
        )?;
        rtp_parameters.mid = Some(self.next_mid.fetch_add(1, Ordering::SeqCst).to_string());

        let consumer = Consumer::new(&producer, rtp_parameters, options.paused);
        producer.add_consumer(Arc::downgrade(&consumer)).await;

        let mut consumers = self.consumers.lock().await;
        consumers.retain(|_, consumer| !consumer.closed());
        consumers.insert(consumer.id.clone(), consumer.clone());
        Ok(consumer)
    }

    /// Closes the transport. Producers and consumers on it are closed too.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for port in self.allocated_ports.iter() {
            self.ports.release(*port);
        }
        {
            let mut state = self.state.lock().await;
            state.dtls_state = DtlsState::Closed;
            state.ice_state = IceState::Closed;
        }

        let producers: Vec<Arc<Producer>> = {
            let mut producers = self.producers.lock().await;
            producers.drain().map(|(_, producer)| producer).collect()
        };
        for producer in producers {
            producer.transport_closed().await;
        }

        let consumers: Vec<Arc<Consumer>> = {
            let mut consumers = self.consumers.lock().await;
            consumers.drain().map(|(_, consumer)| consumer).collect()
        };
        for consumer in consumers {
            consumer.transport_closed();
        }

        let _ = self.event_sender.send(TransportEvent::Close);
        tracing::debug!("WebRtcTransport {} is closed", self.id);
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed() {
            return Err(Error::new_transport(
                format!("Transport {} is closed", self.id),
                TransportErrorKind::TransportClosedError,
            ));
        }
        Ok(())
    }

    pub(crate) async fn ensure_connected(&self) -> Result<(), Error> {
        self.ensure_open()?;
        if self.dtls_state().await != DtlsState::Connected {
            return Err(Error::new_transport(
                format!("Transport {} is not connected", self.id),
                TransportErrorKind::NotConnectedError,
            ));
        }
        Ok(())
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        if !self.closed() {
            for port in self.allocated_ports.iter() {
                self.ports.release(*port);
            }
        }
        tracing::debug!("WebRtcTransport {} is dropped", self.id);
    }
}

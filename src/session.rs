use std::{collections::HashMap, sync::Arc};

use enclose::enc;
use serde_json::Value;
use strum_macros::Display;
use tokio::sync::{broadcast::error::RecvError, mpsc, Mutex};
use uuid::Uuid;

use crate::{
    consumer::{Consumer, ConsumerEvent},
    error::{ConsumerErrorKind, Error, ProducerErrorKind, RouterErrorKind, SessionErrorKind},
    producer::{Producer, ProducerEvent},
    room::Room,
    rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters},
    signaling::message::{Consumed, Notification, SendingMessage, TransportCreated},
    stats::RtpStreamStatsType,
    transport_parameters::{DtlsParameters, DtlsState},
    webrtc_transport::{ConsumerOptions, ProducerOptions, TransportEvent, WebRtcTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Connected,
    RoomJoined,
    TransportsPending,
    Producing,
    ConsumerReady,
    Closed,
}

/// Which of the two transports of a session a request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransportRole {
    Producing,
    Consuming,
}

impl TransportRole {
    pub fn from_sender(sender: bool) -> Self {
        if sender {
            TransportRole::Producing
        } else {
            TransportRole::Consuming
        }
    }
}

/// State of one connected client. A session owns its transports, its
/// producer and its consumers, and releases them when the client leaves.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    room: Arc<Room>,
    sender: mpsc::UnboundedSender<SendingMessage>,
    room_joined: bool,
    producer_transport: Option<Arc<WebRtcTransport>>,
    consumer_transport: Option<Arc<WebRtcTransport>>,
    producer: Option<Arc<Producer>>,
    consumers: Arc<Mutex<HashMap<String, Arc<Consumer>>>>,
    last_consumer_id: Option<String>,
    closed: bool,
}

impl Session {
    pub fn new(room: Arc<Room>, sender: mpsc::UnboundedSender<SendingMessage>) -> Self {
        let id = Uuid::new_v4().to_string();
        tracing::debug!("Session {} is created in room {}", id, room.id);
        Self {
            id,
            room,
            sender,
            room_joined: false,
            producer_transport: None,
            consumer_transport: None,
            producer: None,
            consumers: Arc::new(Mutex::new(HashMap::new())),
            last_consumer_id: None,
            closed: false,
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub async fn state(&self) -> SessionState {
        if self.closed {
            return SessionState::Closed;
        }
        if !self.consumers.lock().await.is_empty() {
            return SessionState::ConsumerReady;
        }
        if self.producer.as_ref().is_some_and(|p| !p.closed()) {
            return SessionState::Producing;
        }
        if self.producer_transport.is_some() || self.consumer_transport.is_some() {
            return SessionState::TransportsPending;
        }
        if self.room_joined {
            return SessionState::RoomJoined;
        }
        SessionState::Connected
    }

    /// First message of every connection.
    pub async fn connection_success(&self) -> Notification {
        Notification::ConnectionSuccess {
            session_id: self.id.clone(),
            producer_exists: self.room.registry.producer_exists().await,
        }
    }

    pub async fn create_room(&mut self) -> Result<RtpCapabilities, Error> {
        self.ensure_open()?;
        self.room.registry.ensure_router().await?;
        self.room_joined = true;
        self.room.registry.rtp_capabilities()
    }

    pub async fn create_transport(&mut self, role: TransportRole) -> Result<TransportCreated, Error> {
        self.ensure_open()?;
        self.room.registry.ensure_open()?;
        let router = self.room.registry.router().ok_or(Error::new_session(
            "createRoom must be called before creating transports".to_owned(),
            SessionErrorKind::RoomNotCreatedError,
        ))?;

        let transport = router
            .create_webrtc_transport(&self.room.transport_config)
            .await?;
        watch_transport(&transport);
        tracing::info!("Transport {} is created as {}", transport.id, role);

        let slot = match role {
            TransportRole::Producing => &mut self.producer_transport,
            TransportRole::Consuming => &mut self.consumer_transport,
        };
        if let Some(previous) = slot.replace(transport.clone()) {
            tracing::info!("Transport {} is replaced by {}", previous.id, transport.id);
            previous.close().await;
        }

        Ok(TransportCreated {
            id: transport.id.clone(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters().await,
            sctp_parameters: transport.sctp_parameters(),
        })
    }

    pub async fn connect_transport(
        &mut self,
        role: TransportRole,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let transport = self.transport(role)?;
        transport.connect(dtls_parameters).await?;
        tracing::info!("Transport {} is connected", transport.id);
        Ok(())
    }

    pub async fn produce(
        &mut self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<String, Error> {
        self.ensure_open()?;
        let transport = self.transport(TransportRole::Producing)?;
        let producer = transport
            .produce(ProducerOptions {
                kind,
                rtp_parameters,
                app_data,
            })
            .await?;
        tracing::info!("Producer {} is created, kind={}", producer.id, producer.kind());

        self.watch_producer(&producer);
        self.room.registry.register_producer(producer.clone()).await;
        if let Some(previous) = self.producer.replace(producer.clone()) {
            previous.close().await;
        }

        self.room
            .broadcast(
                &self.id,
                Notification::NewProducer {
                    producer_id: producer.id.clone(),
                },
            )
            .await;
        Ok(producer.id.clone())
    }

    /// Consumes `producer_id`, or the current producer of the room when it is not given.
    pub async fn consume(
        &mut self,
        rtp_capabilities: RtpCapabilities,
        producer_id: Option<String>,
    ) -> Result<Consumed, Error> {
        self.ensure_open()?;
        let transport = self.transport(TransportRole::Consuming)?;
        transport.ensure_connected().await?;
        let router = self.room.registry.router().ok_or(Error::new_router(
            "Router has not been created".to_owned(),
            RouterErrorKind::RouterNotCreatedError,
        ))?;

        let producer = match producer_id {
            Some(producer_id) => self.room.registry.find_producer(&producer_id).await,
            None => self.room.registry.current_producer().await,
        }
        .ok_or(Error::new_producer(
            "No producer to consume in this room".to_owned(),
            ProducerErrorKind::ProducerNotFoundError,
        ))?;

        if !router.can_consume(&producer.id, &rtp_capabilities).await {
            return Err(Error::new_consumer(
                format!("Can not consume producer {}", producer.id),
                ConsumerErrorKind::CapabilityMismatchError,
            ));
        }

        let consumer = transport
            .consume(ConsumerOptions {
                producer_id: producer.id.clone(),
                rtp_capabilities,
                paused: true,
            })
            .await?;
        tracing::info!(
            "Consumer {} is created for producer {}",
            consumer.id,
            producer.id
        );

        self.watch_consumer(&consumer);
        self.consumers
            .lock()
            .await
            .insert(consumer.id.clone(), consumer.clone());
        self.last_consumer_id = Some(consumer.id.clone());

        Ok(Consumed {
            id: consumer.id.clone(),
            producer_id: producer.id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
        })
    }

    /// Resumes `consumer_id`, or the latest consumer of this session.
    /// Stats are logged in the background and never fail the resume.
    pub async fn resume_consumer(&mut self, consumer_id: Option<String>) -> Result<(), Error> {
        self.ensure_open()?;
        let consumer_id = consumer_id
            .or_else(|| self.last_consumer_id.clone())
            .ok_or(Error::new_consumer(
                "No consumer to resume".to_owned(),
                ConsumerErrorKind::ConsumerNotFoundError,
            ))?;
        let consumer = self
            .consumers
            .lock()
            .await
            .get(&consumer_id)
            .cloned()
            .ok_or(Error::new_consumer(
                format!("Consumer {} is not found", consumer_id),
                ConsumerErrorKind::ConsumerNotFoundError,
            ))?;

        consumer.resume()?;
        tokio::spawn(enc!((consumer) async move {
            log_consumer_stats(consumer);
        }));
        Ok(())
    }

    pub async fn consumer(&self, consumer_id: &str) -> Option<Arc<Consumer>> {
        self.consumers.lock().await.get(consumer_id).cloned()
    }

    /// Releases everything this session owns. The router stays with the room.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let consumers: Vec<Arc<Consumer>> = {
            let mut consumers = self.consumers.lock().await;
            consumers.drain().map(|(_, consumer)| consumer).collect()
        };
        for consumer in consumers {
            consumer.close();
        }
        if let Some(producer) = self.producer.take() {
            producer.close().await;
        }
        for transport in [self.producer_transport.take(), self.consumer_transport.take()]
            .into_iter()
            .flatten()
        {
            transport.close().await;
        }
        tracing::info!("Session {} is closed", self.id);
    }

    fn transport(&self, role: TransportRole) -> Result<Arc<WebRtcTransport>, Error> {
        let transport = match role {
            TransportRole::Producing => self.producer_transport.as_ref(),
            TransportRole::Consuming => self.consumer_transport.as_ref(),
        };
        transport.cloned().ok_or(Error::new_session(
            format!("{} transport has not been created", role),
            SessionErrorKind::TransportNotCreatedError,
        ))
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::new_session(
                format!("Session {} is closed", self.id),
                SessionErrorKind::SessionClosedError,
            ));
        }
        Ok(())
    }

    fn watch_producer(&self, producer: &Arc<Producer>) {
        let mut events = producer.subscribe();
        let producer = Arc::downgrade(producer);
        let room = self.room.clone();
        let session_id = self.id.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProducerEvent::TransportClose) => {
                        tracing::info!("Transport for this producer closed");
                        if let Some(producer) = producer.upgrade() {
                            producer.close().await;
                        }
                    }
                    Ok(ProducerEvent::Close) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(count)) => {
                        tracing::warn!("Producer watcher lagged by {} events", count);
                    }
                }
            }
            let Some(producer) = producer.upgrade() else {
                return;
            };
            room.registry.remove_producer(&producer.id).await;
            room.broadcast(
                &session_id,
                Notification::ProducerClosed {
                    producer_id: producer.id.clone(),
                },
            )
            .await;
        });
    }

    fn watch_consumer(&self, consumer: &Arc<Consumer>) {
        let mut events = consumer.subscribe();
        let consumer_id = consumer.id.clone();
        let consumers = self.consumers.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConsumerEvent::TransportClose) => {
                        tracing::info!("Transport close from consumer {}", consumer_id);
                    }
                    Ok(ConsumerEvent::ProducerClose) => {
                        tracing::info!("Producer of consumer {} closed", consumer_id);
                    }
                    Ok(ConsumerEvent::Pause) | Ok(ConsumerEvent::Resume) => {}
                    Ok(ConsumerEvent::Close) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(count)) => {
                        tracing::warn!("Consumer watcher lagged by {} events", count);
                    }
                }
            }
            // Absent when the session closed the consumer itself.
            if consumers.lock().await.remove(&consumer_id).is_some() {
                let _ = sender.send(SendingMessage::Notification(Notification::ConsumerClosed {
                    consumer_id,
                }));
            }
        });
    }
}

fn watch_transport(transport: &Arc<WebRtcTransport>) {
    let mut events = transport.subscribe();
    let id = transport.id.clone();
    let transport = Arc::downgrade(transport);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::DtlsStateChange(DtlsState::Closed)) => {
                    if let Some(transport) = transport.upgrade() {
                        transport.close().await;
                    }
                }
                Ok(TransportEvent::DtlsStateChange(state)) => {
                    tracing::debug!("DTLS state of transport {} changed to {}", id, state);
                }
                Ok(TransportEvent::IceStateChange(state)) => {
                    tracing::info!("ICE state of transport {} changed to {}", id, state);
                }
                Ok(TransportEvent::Close) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(count)) => {
                    tracing::warn!("Transport watcher lagged by {} events", count);
                }
            }
        }
        tracing::info!("Transport {} closed", id);
    });
}

fn log_consumer_stats(consumer: Arc<Consumer>) {
    match consumer.get_stats() {
        Ok(stats) => {
            tracing::debug!("Consumer {} stats: {:?}", consumer.id, stats);
            for stat in stats
                .iter()
                .filter(|stat| stat.typ == RtpStreamStatsType::InboundRtp)
            {
                tracing::info!(
                    "Packets received: {}, Packets lost: {}",
                    stat.packet_count,
                    stat.packets_lost
                );
            }
        }
        Err(err) => {
            tracing::warn!("Failed to get stats of consumer {}: {}", consumer.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        config::{MediaConfig, WebRTCTransportConfig, WorkerConfig},
        error::ErrorKind,
        registry::{Registry, SharedWorker},
        transport_parameters::{DtlsFingerprint, DtlsRole},
    };

    fn room() -> Arc<Room> {
        let worker = Arc::new(SharedWorker::new(WorkerConfig::default()));
        let registry = Registry::new(worker, MediaConfig::default());
        Arc::new(Room::new(
            "test".to_owned(),
            registry,
            WebRTCTransportConfig::default(),
        ))
    }

    async fn join(room: &Arc<Room>) -> (Session, mpsc::UnboundedReceiver<SendingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(room.clone(), tx.clone());
        room.add_peer(session.id.clone(), tx).await;
        (session, rx)
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_owned(),
                value: "AA:BB".to_owned(),
            }],
        }
    }

    fn vp8() -> RtpParameters {
        serde_json::from_value(json!({
            "mid": "0",
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 96,
                "clockRate": 90000,
                "rtcpFeedback": [{"type": "nack"}]
            }],
            "encodings": [{"ssrc": 1111}],
            "rtcp": {"cname": "peer-a"}
        }))
        .unwrap()
    }

    async fn producing(room: &Arc<Room>) -> (Session, String) {
        let (mut session, _rx) = join(room).await;
        session.create_room().await.unwrap();
        session.create_transport(TransportRole::Producing).await.unwrap();
        session
            .connect_transport(TransportRole::Producing, dtls())
            .await
            .unwrap();
        let producer_id = session
            .produce(MediaKind::Video, vp8(), Value::Null)
            .await
            .unwrap();
        (session, producer_id)
    }

    #[tokio::test]
    async fn state_follows_operations() {
        let room = room();
        let (mut session, _rx) = join(&room).await;
        assert_eq!(session.state().await, SessionState::Connected);

        let err = session
            .create_transport(TransportRole::Producing)
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::SessionError(SessionErrorKind::RoomNotCreatedError)
        );

        session.create_room().await.unwrap();
        assert_eq!(session.state().await, SessionState::RoomJoined);

        session.create_transport(TransportRole::Producing).await.unwrap();
        assert_eq!(session.state().await, SessionState::TransportsPending);

        session.close().await;
        assert_eq!(session.state().await, SessionState::Closed);
        let err = session.create_room().await.unwrap_err();
        assert_eq!(err.code(), "closed");
    }

    #[tokio::test]
    async fn produce_and_consume_before_connect_are_invalid_state() {
        let room = room();
        let (mut session, _rx) = join(&room).await;
        session.create_room().await.unwrap();

        let err = session
            .connect_transport(TransportRole::Consuming, dtls())
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());

        let err = session
            .produce(MediaKind::Video, vp8(), Value::Null)
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());

        session.create_transport(TransportRole::Producing).await.unwrap();
        session.create_transport(TransportRole::Consuming).await.unwrap();

        let err = session
            .produce(MediaKind::Video, vp8(), Value::Null)
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());

        let capabilities = room.registry.rtp_capabilities().unwrap();
        let err = session.consume(capabilities, None).await.unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn capability_mismatch_creates_nothing() {
        let room = room();
        let (_producer_session, producer_id) = producing(&room).await;

        let (mut session, _rx) = join(&room).await;
        session.create_transport(TransportRole::Consuming).await.unwrap();
        session
            .connect_transport(TransportRole::Consuming, dtls())
            .await
            .unwrap();

        let mut audio_only = room.registry.rtp_capabilities().unwrap();
        audio_only.codecs.retain(|codec| codec.kind == MediaKind::Audio);
        let router = room.registry.router().unwrap();
        assert!(!router.can_consume(&producer_id, &audio_only).await);

        let err = session.consume(audio_only, None).await.unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::ConsumerError(ConsumerErrorKind::CapabilityMismatchError)
        );
        assert!(session.consumers.lock().await.is_empty());
        let producer = router.get_producer(&producer_id).await.unwrap();
        assert_eq!(producer.consumer_count().await, 0);
    }

    #[tokio::test]
    async fn consumer_stays_paused_until_resume() {
        let room = room();
        let (_producer_session, producer_id) = producing(&room).await;

        let (mut session, _rx) = join(&room).await;
        session.create_transport(TransportRole::Consuming).await.unwrap();
        session
            .connect_transport(TransportRole::Consuming, dtls())
            .await
            .unwrap();
        let capabilities = room.registry.rtp_capabilities().unwrap();
        let consumed = session.consume(capabilities, None).await.unwrap();
        assert_eq!(consumed.producer_id, producer_id);
        assert_eq!(consumed.kind, MediaKind::Video);
        assert_eq!(session.state().await, SessionState::ConsumerReady);

        let consumer = session.consumer(&consumed.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(consumer.paused());

        session.resume_consumer(None).await.unwrap();
        assert!(!consumer.paused());
    }

    #[tokio::test]
    async fn producer_transport_close_cascades() {
        let room = room();
        let (mut producer_session, producer_id) = producing(&room).await;

        let (mut session, mut rx) = join(&room).await;
        session.create_transport(TransportRole::Consuming).await.unwrap();
        session
            .connect_transport(TransportRole::Consuming, dtls())
            .await
            .unwrap();
        let capabilities = room.registry.rtp_capabilities().unwrap();
        let consumed = session.consume(capabilities, None).await.unwrap();
        let consumer = session.consumer(&consumed.id).await.unwrap();

        let transport = producer_session
            .transport(TransportRole::Producing)
            .unwrap();
        transport.update_dtls_state(DtlsState::Closed).await;

        let mut notifications = Vec::new();
        while notifications.len() < 2 {
            let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            notifications.push(message);
        }
        assert!(transport.closed());
        assert!(consumer.closed());
        assert!(notifications.contains(&SendingMessage::Notification(
            Notification::ProducerClosed {
                producer_id: producer_id.clone()
            }
        )));
        assert!(notifications.contains(&SendingMessage::Notification(
            Notification::ConsumerClosed {
                consumer_id: consumed.id.clone()
            }
        )));
        assert!(!room.registry.producer_exists().await);

        producer_session.close().await;
    }

    async fn next_notification(rx: &mut mpsc::UnboundedReceiver<SendingMessage>) -> SendingMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn second_produce_replaces_the_producer() {
        let room = room();
        let (_observer, mut rx) = join(&room).await;
        let (mut session, first_id) = producing(&room).await;
        assert_eq!(
            next_notification(&mut rx).await,
            SendingMessage::Notification(Notification::NewProducer {
                producer_id: first_id.clone()
            })
        );

        let second_id = session
            .produce(MediaKind::Video, vp8(), Value::Null)
            .await
            .unwrap();
        assert_ne!(first_id, second_id);

        let router = room.registry.router().unwrap();
        let err = router.get_producer(&first_id).await.unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::ProducerError(ProducerErrorKind::ProducerNotFoundError)
        );
        assert!(router.get_producer(&second_id).await.is_ok());
        assert_eq!(
            room.registry.current_producer().await.unwrap().id,
            second_id
        );
        assert!(room.registry.find_producer(&first_id).await.is_none());

        let notifications = vec![
            next_notification(&mut rx).await,
            next_notification(&mut rx).await,
        ];
        assert!(notifications.contains(&SendingMessage::Notification(
            Notification::ProducerClosed {
                producer_id: first_id
            }
        )));
        assert!(notifications.contains(&SendingMessage::Notification(
            Notification::NewProducer {
                producer_id: second_id.clone()
            }
        )));
        assert_eq!(
            room.registry.current_producer().await.unwrap().id,
            second_id
        );

        session.close().await;
    }

    #[tokio::test]
    async fn replacing_the_producing_transport_closes_its_producer() {
        let room = room();
        let (_observer, mut rx) = join(&room).await;
        let (mut session, producer_id) = producing(&room).await;
        next_notification(&mut rx).await;
        let previous = session.transport(TransportRole::Producing).unwrap();

        session.create_transport(TransportRole::Producing).await.unwrap();
        assert!(previous.closed());
        assert_ne!(
            session.transport(TransportRole::Producing).unwrap().id,
            previous.id
        );

        assert_eq!(
            next_notification(&mut rx).await,
            SendingMessage::Notification(Notification::ProducerClosed { producer_id })
        );
        assert!(!room.registry.producer_exists().await);
        assert_eq!(session.state().await, SessionState::TransportsPending);

        session.close().await;
    }

    #[tokio::test]
    async fn resume_survives_failing_stats() {
        let room = room();
        let (_producer_session, _producer_id) = producing(&room).await;

        let (mut session, mut rx) = join(&room).await;
        session.create_transport(TransportRole::Consuming).await.unwrap();
        session
            .connect_transport(TransportRole::Consuming, dtls())
            .await
            .unwrap();
        let capabilities = room.registry.rtp_capabilities().unwrap();
        let consumed = session.consume(capabilities, None).await.unwrap();
        let consumer = session.consumer(&consumed.id).await.unwrap();

        session.resume_consumer(None).await.unwrap();
        assert!(!consumer.paused());
        // Closed before the background stats task gets to run.
        session.consumers.lock().await.remove(&consumed.id);
        consumer.close();
        assert!(consumer.get_stats().is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(!consumer.paused());
    }
}

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use strum_macros::Display;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    error::{ConsumerErrorKind, Error},
    producer::Producer,
    rtp_parameters::{MediaKind, RtpParameters},
    stats::{RtpStreamStats, RtpStreamStatsType, StreamCounters},
};

/// Forwards one producer to a client over its consuming transport.
/// Consumers start paused and only forward media after [`Consumer::resume`].
#[derive(Debug)]
pub struct Consumer {
    pub id: String,
    pub producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    producer: Weak<Producer>,
    paused: AtomicBool,
    counters: StreamCounters,
    event_sender: broadcast::Sender<ConsumerEvent>,
    closed: AtomicBool,
}

impl Consumer {
    pub(crate) fn new(producer: &Arc<Producer>, rtp_parameters: RtpParameters, paused: bool) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let (event_sender, _rx) = broadcast::channel(16);

        tracing::debug!("Consumer {} is created for producer {}", id, producer.id);

        Arc::new(Self {
            id,
            producer_id: producer.id.clone(),
            kind: producer.kind(),
            rtp_parameters,
            producer: Arc::downgrade(producer),
            paused: AtomicBool::new(paused),
            counters: StreamCounters::default(),
            event_sender,
            closed: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.event_sender.subscribe()
    }

    pub fn pause(&self) -> Result<(), Error> {
        self.ensure_open()?;
        if !self.paused.swap(true, Ordering::SeqCst) {
            let _ = self.event_sender.send(ConsumerEvent::Pause);
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<(), Error> {
        self.ensure_open()?;
        if self.paused.swap(false, Ordering::SeqCst) {
            let _ = self.event_sender.send(ConsumerEvent::Resume);
            tracing::debug!("Consumer {} is resumed", self.id);
        }
        Ok(())
    }

    /// Own outbound stream followed by the inbound stream of the producer.
    pub fn get_stats(&self) -> Result<Vec<RtpStreamStats>, Error> {
        self.ensure_open()?;
        let ssrc = self
            .rtp_parameters
            .encodings
            .first()
            .and_then(|encoding| encoding.ssrc)
            .unwrap_or_default();
        let mime_type = self
            .rtp_parameters
            .codecs
            .first()
            .map(|codec| codec.mime_type.as_str())
            .unwrap_or_default();

        let mut stats = vec![self.counters.snapshot(
            RtpStreamStatsType::OutboundRtp,
            ssrc,
            self.kind,
            mime_type,
        )];
        if let Some(producer) = self.producer.upgrade() {
            stats.extend(producer.get_stats());
        }
        Ok(stats)
    }

    pub(crate) fn send_rtp(&self, sequence_number: u16, len: usize) {
        if self.closed() || self.paused() {
            return;
        }
        self.counters.record(sequence_number, len);
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.event_sender.send(ConsumerEvent::Close);
        tracing::debug!("Consumer {} is closed", self.id);
    }

    pub(crate) fn producer_closed(&self) {
        if self.closed() {
            return;
        }
        let _ = self.event_sender.send(ConsumerEvent::ProducerClose);
        self.close();
    }

    pub(crate) fn transport_closed(&self) {
        if self.closed() {
            return;
        }
        let _ = self.event_sender.send(ConsumerEvent::TransportClose);
        self.close();
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed() {
            return Err(Error::new_consumer(
                format!("Consumer {} is closed", self.id),
                ConsumerErrorKind::ConsumerClosedError,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConsumerEvent {
    TransportClose,
    ProducerClose,
    Pause,
    Resume,
    Close,
}

impl Drop for Consumer {
    fn drop(&mut self) {
        tracing::debug!("Consumer {} is dropped", self.id);
    }
}

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use serde_json::Value;
use strum_macros::Display;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::{
    consumer::Consumer,
    router::RouterEvent,
    rtp_parameters::{MediaKind, RtpParameters},
    stats::{RtpStreamStats, RtpStreamStatsType, StreamCounters},
};

/// A media source sent by a client over its producing transport.
#[derive(Debug)]
pub struct Producer {
    pub id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumable_rtp_parameters: RtpParameters,
    app_data: Value,
    consumers: Mutex<Vec<Weak<Consumer>>>,
    router_event_sender: mpsc::UnboundedSender<RouterEvent>,
    counters: StreamCounters,
    event_sender: broadcast::Sender<ProducerEvent>,
    closed: AtomicBool,
}

impl Producer {
    pub(crate) fn new(
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        consumable_rtp_parameters: RtpParameters,
        app_data: Value,
        router_event_sender: mpsc::UnboundedSender<RouterEvent>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let (event_sender, _rx) = broadcast::channel(16);

        let producer = Arc::new(Self {
            id: id.clone(),
            kind,
            rtp_parameters,
            consumable_rtp_parameters,
            app_data,
            consumers: Mutex::new(Vec::new()),
            router_event_sender,
            counters: StreamCounters::default(),
            event_sender,
            closed: AtomicBool::new(false),
        });

        let _ = producer
            .router_event_sender
            .send(RouterEvent::ProducerAdded(id.clone(), Arc::downgrade(&producer)));

        tracing::debug!("Producer {} is created", id);
        producer
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    /// Parameters mapped onto the router's payload types. Consumers are derived from these.
    pub fn consumable_rtp_parameters(&self) -> &RtpParameters {
        &self.consumable_rtp_parameters
    }

    pub fn app_data(&self) -> &Value {
        &self.app_data
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.event_sender.subscribe()
    }

    pub(crate) async fn add_consumer(&self, consumer: Weak<Consumer>) {
        let mut consumers = self.consumers.lock().await;
        consumers.retain(|consumer| consumer.strong_count() > 0);
        consumers.push(consumer);
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers().await.len()
    }

    /// Open consumers of this producer.
    pub async fn consumers(&self) -> Vec<Arc<Consumer>> {
        let consumers = self.consumers.lock().await;
        consumers
            .iter()
            .filter_map(|consumer| consumer.upgrade())
            .filter(|consumer| !consumer.closed())
            .collect()
    }

    /// Accounts one RTP packet received from the client and forwards it to
    /// every consumer that is not paused.
    pub async fn receive_rtp(&self, sequence_number: u16, len: usize) {
        if self.closed() {
            return;
        }
        self.counters.record(sequence_number, len);
        let consumers = self.consumers.lock().await;
        for consumer in consumers.iter().filter_map(|consumer| consumer.upgrade()) {
            consumer.send_rtp(sequence_number, len);
        }
    }

    pub fn get_stats(&self) -> Vec<RtpStreamStats> {
        let ssrc = self
            .rtp_parameters
            .encodings
            .first()
            .and_then(|encoding| encoding.ssrc)
            .unwrap_or_default();
        let mime_type = self
            .rtp_parameters
            .codecs
            .iter()
            .find(|codec| !codec.is_rtx())
            .map(|codec| codec.mime_type.as_str())
            .unwrap_or_default();
        vec![self
            .counters
            .snapshot(RtpStreamStatsType::InboundRtp, ssrc, self.kind, mime_type)]
    }

    /// Closes the producer. Every consumer of it is closed too.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .router_event_sender
            .send(RouterEvent::ProducerRemoved(self.id.clone()));

        let consumers: Vec<Weak<Consumer>> = {
            let mut consumers = self.consumers.lock().await;
            consumers.drain(..).collect()
        };
        for consumer in consumers.iter().filter_map(|consumer| consumer.upgrade()) {
            consumer.producer_closed();
        }

        let _ = self.event_sender.send(ProducerEvent::Close);
        tracing::debug!("Producer {} is closed", self.id);
    }

    pub(crate) async fn transport_closed(&self) {
        if self.closed() {
            return;
        }
        let _ = self.event_sender.send(ProducerEvent::TransportClose);
        self.close().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ProducerEvent {
    TransportClose,
    Close,
}

impl Drop for Producer {
    fn drop(&mut self) {
        tracing::debug!("Producer {} is dropped", self.id);
    }
}

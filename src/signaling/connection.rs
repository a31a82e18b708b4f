use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    room::Room,
    session::Session,
    signaling::{
        handler,
        message::{ReceivedMessage, SendingMessage},
    },
};

/// Serves one client until `inbound` is closed.
///
/// Each text frame is handled to completion before the next one is read, so
/// the operations of one client never interleave. A response is sent only
/// for requests that carry an `id`. When the client leaves, everything its
/// session owns is closed. Returns the number of peers left in the room.
pub async fn serve(
    room: Arc<Room>,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<SendingMessage>,
) -> usize {
    let session = join(&room, outbound.clone()).await;
    run(session, inbound, outbound).await
}

/// Adds a new session to `room`. Callers that remove empty rooms should
/// join while holding the room owner.
pub async fn join(room: &Arc<Room>, outbound: mpsc::UnboundedSender<SendingMessage>) -> Session {
    let session = Session::new(room.clone(), outbound.clone());
    room.add_peer(session.id.clone(), outbound).await;
    tracing::info!("Session {} connected to room {}", session.id, room.id);
    session
}

/// Drives a joined session until `inbound` is closed, then leaves its room.
pub async fn run(
    mut session: Session,
    mut inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<SendingMessage>,
) -> usize {
    let connected = SendingMessage::Notification(session.connection_success().await);
    if outbound.send(connected).is_ok() {
        while let Some(text) = inbound.recv().await {
            let Some(response) = dispatch(&mut session, &text).await else {
                continue;
            };
            if outbound.send(response).is_err() {
                tracing::warn!("Session {} lost its outbound channel", session.id);
                break;
            }
        }
    }

    session.close().await;
    let room = session.room().clone();
    let remaining = room.remove_peer(&session.id).await;
    tracing::info!(
        "Session {} disconnected, {} peers left in room {}",
        session.id,
        remaining,
        room.id
    );
    remaining
}

async fn dispatch(session: &mut Session, text: &str) -> Option<SendingMessage> {
    match ReceivedMessage::decode(text) {
        Ok((id, message)) => {
            let data = handler::handle(session, message).await?;
            id.map(|id| SendingMessage::Response { id, data })
        }
        Err(err) => {
            tracing::warn!("Session {} sent an invalid message: {}", session.id, err);
            request_id(text).map(|id| SendingMessage::Response {
                id,
                data: handler::error_payload(&err),
            })
        }
    }
}

/// Recovers the request id of a message that could not be decoded.
fn request_id(text: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("id")?.as_u64()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::{
        config::{MediaConfig, WebRTCTransportConfig, WorkerConfig},
        registry::{Registry, SharedWorker},
        signaling::message::Notification,
    };

    struct Client {
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<SendingMessage>,
        next_id: u64,
        notifications: Vec<Notification>,
        task: JoinHandle<usize>,
    }

    impl Client {
        async fn connect(room: &Arc<Room>) -> (Client, Notification) {
            let (tx, inbound) = mpsc::unbounded_channel();
            let (outbound, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(serve(room.clone(), inbound, outbound));
            let mut client = Client {
                tx,
                rx,
                next_id: 0,
                notifications: Vec::new(),
                task,
            };
            let connected = client.notification().await;
            (client, connected)
        }

        async fn recv(&mut self) -> SendingMessage {
            tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out")
                .expect("connection closed")
        }

        async fn request(&mut self, event: &str, data: Value) -> Value {
            self.next_id += 1;
            let id = self.next_id;
            self.tx
                .send(json!({"id": id, "event": event, "data": data}).to_string())
                .unwrap();
            loop {
                match self.recv().await {
                    SendingMessage::Response { id: got, data } if got == id => return data,
                    SendingMessage::Response { id: got, .. } => {
                        panic!("unexpected response {}", got)
                    }
                    SendingMessage::Notification(notification) => {
                        self.notifications.push(notification)
                    }
                }
            }
        }

        fn emit(&self, event: &str, data: Value) {
            self.tx
                .send(json!({"event": event, "data": data}).to_string())
                .unwrap();
        }

        async fn notification(&mut self) -> Notification {
            if !self.notifications.is_empty() {
                return self.notifications.remove(0);
            }
            match self.recv().await {
                SendingMessage::Notification(notification) => notification,
                other => panic!("unexpected message {:?}", other),
            }
        }

        async fn disconnect(self) -> usize {
            drop(self.tx);
            self.task.await.unwrap()
        }
    }

    fn room() -> Arc<Room> {
        let worker = Arc::new(SharedWorker::new(WorkerConfig::default()));
        Arc::new(Room::new(
            "connection".to_owned(),
            Registry::new(worker, MediaConfig::default()),
            WebRTCTransportConfig::default(),
        ))
    }

    fn dtls_parameters() -> Value {
        json!({
            "role": "client",
            "fingerprints": [{"algorithm": "sha-256", "value": "AA:BB:CC"}]
        })
    }

    fn video_parameters() -> Value {
        json!({
            "mid": "0",
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 96,
                "clockRate": 90000,
                "rtcpFeedback": [{"type": "nack"}, {"type": "nack", "parameter": "pli"}]
            }],
            "encodings": [{"ssrc": 22222222}],
            "rtcp": {"cname": "peer-a"}
        })
    }

    /// Peer A joins, creates a producing transport, connects it and produces video.
    async fn publish(room: &Arc<Room>) -> (Client, String) {
        let (mut client, connected) = Client::connect(room).await;
        match connected {
            Notification::ConnectionSuccess {
                producer_exists, ..
            } => assert!(!producer_exists),
            other => panic!("unexpected notification {:?}", other),
        }

        let response = client.request("createRoom", Value::Null).await;
        assert!(response["rtpCapabilities"]["codecs"].is_array());

        let transport = client
            .request("createWebRtcTransport", json!({"sender": true}))
            .await;
        assert!(transport["id"].is_string());
        assert!(transport["iceParameters"]["usernameFragment"].is_string());
        assert!(!transport["iceCandidates"].as_array().unwrap().is_empty());
        assert!(!transport["dtlsParameters"]["fingerprints"]
            .as_array()
            .unwrap()
            .is_empty());

        let ack = client
            .request(
                "transport-connect",
                json!({"dtlsParameters": dtls_parameters()}),
            )
            .await;
        assert_eq!(ack, json!({}));

        let produced = client
            .request(
                "transport-produce",
                json!({"kind": "video", "rtpParameters": video_parameters(), "appData": {}}),
            )
            .await;
        let producer_id = produced["id"].as_str().unwrap().to_owned();
        (client, producer_id)
    }

    /// Peer B joins and prepares a connected consuming transport.
    async fn subscribe(room: &Arc<Room>) -> (Client, Value) {
        let (mut client, connected) = Client::connect(room).await;
        match connected {
            Notification::ConnectionSuccess {
                producer_exists, ..
            } => assert!(producer_exists),
            other => panic!("unexpected notification {:?}", other),
        }

        let capabilities = client.request("createRoom", Value::Null).await["rtpCapabilities"].clone();
        let transport = client
            .request("createWebRtcTransport", json!({"sender": false}))
            .await;
        assert!(transport["error"].is_null());
        let ack = client
            .request(
                "transport-recv-connect",
                json!({"dtlsParameters": dtls_parameters()}),
            )
            .await;
        assert_eq!(ack, json!({}));
        (client, capabilities)
    }

    #[tokio::test]
    async fn peer_consumes_published_video() {
        let room = room();
        let (peer_a, producer_id) = publish(&room).await;
        let (mut peer_b, capabilities) = subscribe(&room).await;

        let response = peer_b
            .request("consume", json!({"rtpCapabilities": capabilities}))
            .await;
        let params = &response["params"];
        assert!(params["error"].is_null());
        assert_eq!(params["producerId"], producer_id.as_str());
        assert_eq!(params["kind"], "video");
        assert_eq!(params["rtpParameters"]["codecs"][0]["mimeType"], "video/VP8");

        let producer = room.registry.find_producer(&producer_id).await.unwrap();
        let consumers = producer.consumers().await;
        assert_eq!(consumers.len(), 1);
        let consumer = consumers[0].clone();
        assert_eq!(consumer.id, params["id"].as_str().unwrap());
        assert!(consumer.paused());

        peer_b.emit("consumer-resume", json!({}));
        // Requests are handled in order, so the resume is done once this answers.
        peer_b.request("createRoom", Value::Null).await;
        assert!(!consumer.paused());

        assert_eq!(peer_a.disconnect().await, 1);
        let mut closed = vec![peer_b.notification().await, peer_b.notification().await];
        closed.sort_by_key(|notification| format!("{:?}", notification));
        assert_eq!(
            closed,
            vec![
                Notification::ConsumerClosed {
                    consumer_id: consumer.id.clone()
                },
                Notification::ProducerClosed {
                    producer_id: producer_id.clone()
                },
            ]
        );
        assert!(consumer.closed());
        assert_eq!(peer_b.disconnect().await, 0);

        let worker = room.registry.ensure_worker().await.unwrap();
        assert_eq!(worker.used_ports(), 0);
    }

    #[tokio::test]
    async fn incompatible_capabilities_are_rejected() {
        let room = room();
        let (peer_a, producer_id) = publish(&room).await;
        let (mut peer_b, mut capabilities) = subscribe(&room).await;

        capabilities["codecs"]
            .as_array_mut()
            .unwrap()
            .retain(|codec| codec["kind"] == "audio");
        let response = peer_b
            .request("consume", json!({"rtpCapabilities": capabilities}))
            .await;
        assert_eq!(response["params"]["error"]["kind"], "capabilityMismatch");
        assert!(response["params"]["id"].is_null());

        let producer = room.registry.find_producer(&producer_id).await.unwrap();
        assert_eq!(producer.consumer_count().await, 0);

        peer_b.disconnect().await;
        peer_a.disconnect().await;
    }

    #[tokio::test]
    async fn invalid_messages_keep_the_connection() {
        let room = room();
        let (mut client, _) = Client::connect(&room).await;

        client.tx.send(r#"{"event": "pause"}"#.to_owned()).unwrap();
        client
            .tx
            .send(r#"{"id": 41, "event": "createWebRtcTransport", "data": {}}"#.to_owned())
            .unwrap();
        match client.recv().await {
            SendingMessage::Response { id, data } => {
                assert_eq!(id, 41);
                assert_eq!(data["error"]["kind"], "invalidParameters");
            }
            other => panic!("unexpected message {:?}", other),
        }

        let response = client
            .request("transport-produce", json!({"kind": "video", "rtpParameters": video_parameters()}))
            .await;
        assert_eq!(response["error"]["kind"], "invalidState");

        let response = client.request("createRoom", Value::Null).await;
        assert!(response["error"].is_null());
        assert_eq!(client.disconnect().await, 0);
    }
}

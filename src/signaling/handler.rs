use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    error::Error,
    session::{Session, TransportRole},
    signaling::message::{ErrorPayload, Produced, ReceivedMessage, RoomCreated},
};

/// Runs the session operation for `message` and builds the response payload.
/// Failures are logged and returned as `{error}` payloads so the connection survives.
/// `None` means the event never responds.
pub async fn handle(session: &mut Session, message: ReceivedMessage) -> Option<Value> {
    let event = message.event();
    let wrap_params = matches!(message, ReceivedMessage::Consume { .. });
    tracing::debug!("Session {} received {}", session.id, event);

    let result = match message {
        ReceivedMessage::CreateRoom {} => session
            .create_room()
            .await
            .and_then(|rtp_capabilities| to_value(RoomCreated { rtp_capabilities })),
        ReceivedMessage::CreateWebRtcTransport { sender } => session
            .create_transport(TransportRole::from_sender(sender))
            .await
            .and_then(to_value),
        ReceivedMessage::TransportConnect { dtls_parameters } => session
            .connect_transport(TransportRole::Producing, dtls_parameters)
            .await
            .map(|_| json!({})),
        ReceivedMessage::TransportProduce {
            kind,
            rtp_parameters,
            app_data,
        } => session
            .produce(kind, rtp_parameters, app_data)
            .await
            .and_then(|id| to_value(Produced { id })),
        ReceivedMessage::TransportRecvConnect { dtls_parameters } => session
            .connect_transport(TransportRole::Consuming, dtls_parameters)
            .await
            .map(|_| json!({})),
        ReceivedMessage::Consume {
            rtp_capabilities,
            producer_id,
        } => session
            .consume(rtp_capabilities, producer_id)
            .await
            .and_then(to_value),
        ReceivedMessage::ConsumerResume { consumer_id } => {
            if let Err(err) = session.resume_consumer(consumer_id).await {
                tracing::warn!("Session {} failed to {}: {}", session.id, event, err);
            }
            return None;
        }
    };

    let payload = match result {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!("Session {} failed to {}: {}", session.id, event, err);
            error_payload(&err)
        }
    };
    // consume wraps both outcomes in `params`.
    if wrap_params {
        Some(json!({ "params": payload }))
    } else {
        Some(payload)
    }
}

/// Payload for a failed request. Also used for messages that could not be decoded.
pub fn error_payload(err: &Error) -> Value {
    json!({ "error": ErrorPayload::from(err) })
}

fn to_value<T: Serialize>(data: T) -> Result<Value, Error> {
    Ok(serde_json::to_value(data)?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::{MediaConfig, WebRTCTransportConfig, WorkerConfig},
        registry::{Registry, SharedWorker},
        room::Room,
        rtp_parameters::RtpCapabilities,
    };

    fn session() -> Session {
        let worker = Arc::new(SharedWorker::new(WorkerConfig::default()));
        let room = Arc::new(Room::new(
            "handler".to_owned(),
            Registry::new(worker, MediaConfig::default()),
            WebRTCTransportConfig::default(),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        Session::new(room, tx)
    }

    #[tokio::test]
    async fn create_room_returns_capabilities() {
        let mut session = session();
        let response = handle(&mut session, ReceivedMessage::CreateRoom {})
            .await
            .unwrap();
        let codecs = response["rtpCapabilities"]["codecs"].as_array().unwrap();
        assert_eq!(codecs.len(), 3);
        assert_eq!(codecs[0]["mimeType"], "audio/opus");
    }

    #[tokio::test]
    async fn failures_become_error_payloads() {
        let mut session = session();
        let response = handle(
            &mut session,
            ReceivedMessage::CreateWebRtcTransport { sender: true },
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["kind"], "invalidState");

        handle(&mut session, ReceivedMessage::CreateRoom {}).await;
        let response = handle(
            &mut session,
            ReceivedMessage::Consume {
                rtp_capabilities: RtpCapabilities::default(),
                producer_id: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(response["params"]["error"]["kind"], "invalidState");
    }

    #[tokio::test]
    async fn resume_never_responds() {
        let mut session = session();
        let response = handle(
            &mut session,
            ReceivedMessage::ConsumerResume { consumer_id: None },
        )
        .await;
        assert!(response.is_none());
    }
}

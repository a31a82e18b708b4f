use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::{Error, SignalingErrorKind},
    rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters},
    transport_parameters::{DtlsParameters, IceCandidate, IceParameters, SctpParameters},
};

/// Envelope of every client message. `id` is set when the client waits for a response.
#[derive(Deserialize, Debug)]
pub struct Request {
    #[serde(default)]
    pub id: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ReceivedMessage {
    #[serde(rename = "createRoom")]
    CreateRoom {},
    #[serde(rename = "createWebRtcTransport")]
    CreateWebRtcTransport { sender: bool },
    #[serde(rename = "transport-connect", rename_all = "camelCase")]
    TransportConnect { dtls_parameters: DtlsParameters },
    #[serde(rename = "transport-produce", rename_all = "camelCase")]
    TransportProduce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: Value,
    },
    #[serde(rename = "transport-recv-connect", rename_all = "camelCase")]
    TransportRecvConnect { dtls_parameters: DtlsParameters },
    #[serde(rename = "consume", rename_all = "camelCase")]
    Consume {
        rtp_capabilities: RtpCapabilities,
        #[serde(default)]
        producer_id: Option<String>,
    },
    #[serde(rename = "consumer-resume", rename_all = "camelCase")]
    ConsumerResume {
        #[serde(default)]
        consumer_id: Option<String>,
    },
}

impl ReceivedMessage {
    pub const EVENTS: [&'static str; 7] = [
        "createRoom",
        "createWebRtcTransport",
        "transport-connect",
        "transport-produce",
        "transport-recv-connect",
        "consume",
        "consumer-resume",
    ];

    /// Parses a text frame into the request id and the message.
    pub fn decode(text: &str) -> Result<(Option<u64>, ReceivedMessage), Error> {
        let request: Request = serde_json::from_str(text)?;
        let message = Self::from_request(&request.event, request.data)?;
        Ok((request.id, message))
    }

    pub fn from_request(event: &str, data: Value) -> Result<ReceivedMessage, Error> {
        if !Self::EVENTS.contains(&event) {
            return Err(Error::new_signaling(
                format!("Unknown event {}", event),
                SignalingErrorKind::UnknownEventError,
            ));
        }
        // Events without arguments may come with no data at all.
        let data = match data {
            Value::Null => json!({}),
            data => data,
        };
        let message = serde_json::from_value(json!({ "event": event, "data": data }))?;
        Ok(message)
    }

    pub fn event(&self) -> &'static str {
        match self {
            ReceivedMessage::CreateRoom {} => "createRoom",
            ReceivedMessage::CreateWebRtcTransport { .. } => "createWebRtcTransport",
            ReceivedMessage::TransportConnect { .. } => "transport-connect",
            ReceivedMessage::TransportProduce { .. } => "transport-produce",
            ReceivedMessage::TransportRecvConnect { .. } => "transport-recv-connect",
            ReceivedMessage::Consume { .. } => "consume",
            ReceivedMessage::ConsumerResume { .. } => "consumer-resume",
        }
    }
}

/// Pushed to clients without a preceding request.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum Notification {
    #[serde(rename = "connection-success", rename_all = "camelCase")]
    ConnectionSuccess {
        session_id: String,
        producer_exists: bool,
    },
    #[serde(rename = "new-producer", rename_all = "camelCase")]
    NewProducer { producer_id: String },
    #[serde(rename = "producer-closed", rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
    #[serde(rename = "consumer-closed", rename_all = "camelCase")]
    ConsumerClosed { consumer_id: String },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum SendingMessage {
    Response { id: u64, data: Value },
    Notification(Notification),
}

impl SendingMessage {
    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.code(),
            message: err.message.clone(),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreated {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<SctpParameters>,
}

#[derive(Serialize, Debug, Clone)]
pub struct Produced {
    pub id: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Consumed {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

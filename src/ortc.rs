use std::collections::HashSet;

use uuid::Uuid;

use crate::{
    error::{ConsumerErrorKind, Error, ProducerErrorKind, RouterErrorKind},
    rtp_parameters::{
        CodecParameters, MediaKind, RtcpParameters, RtpCapabilities, RtpCodecCapability,
        RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtensionParameters, RtpParameters,
        RtxParameters,
    },
    supported_rtp_capabilities::supported_rtp_capabilities,
};

const DYNAMIC_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 100..=127;

struct CodecRef<'a> {
    mime_type: &'a str,
    clock_rate: u32,
    channels: Option<u8>,
    parameters: &'a CodecParameters,
}

impl<'a> From<&'a RtpCodecCapability> for CodecRef<'a> {
    fn from(codec: &'a RtpCodecCapability) -> Self {
        Self {
            mime_type: &codec.mime_type,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: &codec.parameters,
        }
    }
}

impl<'a> From<&'a RtpCodecParameters> for CodecRef<'a> {
    fn from(codec: &'a RtpCodecParameters) -> Self {
        Self {
            mime_type: &codec.mime_type,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: &codec.parameters,
        }
    }
}

fn codecs_match<'a, 'b>(a: impl Into<CodecRef<'a>>, b: impl Into<CodecRef<'b>>) -> bool {
    let a = a.into();
    let b = b.into();
    if !a.mime_type.eq_ignore_ascii_case(b.mime_type) || a.clock_rate != b.clock_rate {
        return false;
    }
    if MediaKind::from_mime_type(a.mime_type) == Some(MediaKind::Audio)
        && a.channels.unwrap_or(1) != b.channels.unwrap_or(1)
    {
        return false;
    }
    if a.mime_type.eq_ignore_ascii_case("video/H264") {
        let mode = |parameters: &CodecParameters| {
            parameters
                .get("packetization-mode")
                .and_then(|value| value.as_u64())
                .unwrap_or(0)
        };
        if mode(a.parameters) != mode(b.parameters) {
            return false;
        }
    }
    true
}

fn next_dynamic_payload_type(used: &HashSet<u8>) -> Result<u8, Error> {
    DYNAMIC_PAYLOAD_TYPES
        .into_iter()
        .find(|pt| !used.contains(pt))
        .ok_or(Error::new_router(
            "No more dynamic payload types available".to_owned(),
            RouterErrorKind::PayloadTypeExhaustedError,
        ))
}

pub(crate) fn generate_ssrc() -> u32 {
    Uuid::new_v4().as_fields().0
}

pub(crate) fn generate_cname() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Builds the capabilities of a router from the configured media codecs.
/// Every codec must be in the supported list. Payload types are assigned and
/// an RTX codec is added for each video codec.
pub(crate) fn generate_router_rtp_capabilities(
    media_codecs: &[RtpCodecCapability],
) -> Result<RtpCapabilities, Error> {
    let supported = supported_rtp_capabilities();
    let mut used = HashSet::new();

    for media_codec in media_codecs {
        if let Some(pt) = media_codec.preferred_payload_type {
            if !used.insert(pt) {
                return Err(Error::new_router(
                    format!("Duplicated preferredPayloadType {}", pt),
                    RouterErrorKind::InvalidCodecError,
                ));
            }
        }
    }

    let mut capabilities = RtpCapabilities::default();
    for media_codec in media_codecs {
        let kind = MediaKind::from_mime_type(&media_codec.mime_type).ok_or(Error::new_router(
            format!("Invalid mimeType {}", media_codec.mime_type),
            RouterErrorKind::InvalidCodecError,
        ))?;
        if kind != media_codec.kind {
            return Err(Error::new_router(
                format!(
                    "mimeType {} does not match kind {}",
                    media_codec.mime_type, media_codec.kind
                ),
                RouterErrorKind::InvalidCodecError,
            ));
        }
        if media_codec.is_rtx() {
            return Err(Error::new_router(
                "RTX codecs must not be configured".to_owned(),
                RouterErrorKind::InvalidCodecError,
            ));
        }
        if media_codec.clock_rate == 0 {
            return Err(Error::new_router(
                format!("Invalid clockRate for {}", media_codec.mime_type),
                RouterErrorKind::InvalidCodecError,
            ));
        }

        let supported_codec = supported
            .codecs
            .iter()
            .find(|codec| codecs_match(media_codec, *codec))
            .ok_or(Error::new_router(
                format!(
                    "Media codec not supported: mimeType={}, clockRate={}",
                    media_codec.mime_type, media_codec.clock_rate
                ),
                RouterErrorKind::UnsupportedCodecError,
            ))?;

        let payload_type = match media_codec.preferred_payload_type {
            Some(pt) => pt,
            None => match supported_codec.preferred_payload_type {
                Some(pt) if !used.contains(&pt) => pt,
                _ => next_dynamic_payload_type(&used)?,
            },
        };
        used.insert(payload_type);

        let mut parameters = supported_codec.parameters.clone();
        parameters.extend(media_codec.parameters.clone());

        capabilities.codecs.push(RtpCodecCapability {
            kind,
            mime_type: supported_codec.mime_type.clone(),
            preferred_payload_type: Some(payload_type),
            clock_rate: supported_codec.clock_rate,
            channels: match kind {
                MediaKind::Audio => Some(media_codec.channels.unwrap_or(1)),
                MediaKind::Video => None,
            },
            parameters,
            rtcp_feedback: supported_codec.rtcp_feedback.clone(),
        });

        if kind == MediaKind::Video {
            let rtx_payload_type = next_dynamic_payload_type(&used)?;
            used.insert(rtx_payload_type);
            let mut rtx_parameters = CodecParameters::new();
            rtx_parameters.insert("apt".to_owned(), payload_type.into());
            capabilities.codecs.push(RtpCodecCapability {
                kind,
                mime_type: "video/rtx".to_owned(),
                preferred_payload_type: Some(rtx_payload_type),
                clock_rate: supported_codec.clock_rate,
                channels: None,
                parameters: rtx_parameters,
                rtcp_feedback: vec![],
            });
        }
    }

    capabilities.header_extensions = supported
        .header_extensions
        .into_iter()
        .filter(|extension| {
            capabilities
                .codecs
                .iter()
                .any(|codec| codec.kind == extension.kind)
        })
        .collect();

    Ok(capabilities)
}

/// Validates what a producer announces and maps it onto the router's payload
/// types. The result is what every consumer of the producer is derived from.
pub(crate) fn get_consumable_rtp_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    router_capabilities: &RtpCapabilities,
) -> Result<RtpParameters, Error> {
    if rtp_parameters.codecs.is_empty() {
        return Err(Error::new_producer(
            "rtpParameters.codecs must not be empty".to_owned(),
            ProducerErrorKind::InvalidRtpParametersError,
        ));
    }
    for codec in rtp_parameters.codecs.iter() {
        if MediaKind::from_mime_type(&codec.mime_type) != Some(kind) {
            return Err(Error::new_producer(
                format!("Codec {} does not match kind {}", codec.mime_type, kind),
                ProducerErrorKind::InvalidRtpParametersError,
            ));
        }
        if codec.is_rtx() {
            let associated = codec.apt().and_then(|apt| {
                rtp_parameters
                    .codecs
                    .iter()
                    .find(|media| !media.is_rtx() && media.payload_type == apt)
            });
            if associated.is_none() {
                return Err(Error::new_producer(
                    format!(
                        "RTX codec with payloadType {} has no associated media codec",
                        codec.payload_type
                    ),
                    ProducerErrorKind::InvalidRtpParametersError,
                ));
            }
        }
    }

    let mut consumable = RtpParameters::default();
    for codec in rtp_parameters.codecs.iter().filter(|codec| !codec.is_rtx()) {
        let Some(capability) = router_capabilities
            .codecs
            .iter()
            .find(|capability| !capability.is_rtx() && codecs_match(codec, *capability))
        else {
            tracing::debug!("Producer codec {} is ignored by the router", codec.mime_type);
            continue;
        };
        let Some(payload_type) = capability.preferred_payload_type else {
            continue;
        };

        consumable.codecs.push(RtpCodecParameters {
            mime_type: capability.mime_type.clone(),
            payload_type,
            clock_rate: capability.clock_rate,
            channels: capability.channels,
            parameters: codec.parameters.clone(),
            rtcp_feedback: capability.rtcp_feedback.clone(),
        });

        let rtx_capability = router_capabilities.codecs.iter().find(|rtx| {
            rtx.is_rtx()
                && rtx
                    .parameters
                    .get("apt")
                    .and_then(|apt| apt.as_u64())
                    .map(|apt| apt == payload_type as u64)
                    .unwrap_or(false)
        });
        if let Some(rtx) = rtx_capability {
            if let Some(rtx_payload_type) = rtx.preferred_payload_type {
                consumable.codecs.push(RtpCodecParameters {
                    mime_type: rtx.mime_type.clone(),
                    payload_type: rtx_payload_type,
                    clock_rate: rtx.clock_rate,
                    channels: None,
                    parameters: rtx.parameters.clone(),
                    rtcp_feedback: vec![],
                });
            }
        }
    }

    if consumable.codecs.is_empty() {
        return Err(Error::new_producer(
            "No producer codec is supported by the router".to_owned(),
            ProducerErrorKind::UnsupportedCodecError,
        ));
    }

    consumable.header_extensions = router_capabilities
        .header_extensions
        .iter()
        .filter(|extension| extension.kind == kind)
        .filter(|extension| {
            rtp_parameters
                .header_extensions
                .iter()
                .any(|announced| announced.uri == extension.uri)
        })
        .map(|extension| RtpHeaderExtensionParameters {
            uri: extension.uri.clone(),
            id: extension.preferred_id,
            encrypt: extension.preferred_encrypt,
        })
        .collect();

    consumable.encodings = if rtp_parameters.encodings.is_empty() {
        vec![RtpEncodingParameters {
            ssrc: Some(generate_ssrc()),
            ..Default::default()
        }]
    } else {
        rtp_parameters
            .encodings
            .iter()
            .map(|encoding| RtpEncodingParameters {
                ssrc: Some(generate_ssrc()),
                rid: None,
                rtx: None,
                max_bitrate: encoding.max_bitrate,
                scalability_mode: encoding.scalability_mode.clone(),
                dtx: encoding.dtx,
            })
            .collect()
    };

    consumable.rtcp = RtcpParameters {
        cname: Some(
            rtp_parameters
                .rtcp
                .cname
                .clone()
                .unwrap_or_else(generate_cname),
        ),
        reduced_size: true,
    };

    Ok(consumable)
}

/// Whether an endpoint with the given capabilities can receive a producer
/// whose consumable parameters are given.
pub fn can_consume(consumable: &RtpParameters, capabilities: &RtpCapabilities) -> bool {
    consumable
        .codecs
        .iter()
        .filter(|codec| !codec.is_rtx())
        .any(|codec| {
            capabilities
                .codecs
                .iter()
                .any(|capability| !capability.is_rtx() && codecs_match(codec, capability))
        })
}

/// Reduces the consumable parameters of a producer to the first codec the
/// remote endpoint supports.
pub(crate) fn get_consumer_rtp_parameters(
    consumable: &RtpParameters,
    capabilities: &RtpCapabilities,
) -> Result<RtpParameters, Error> {
    let (codec, capability) = consumable
        .codecs
        .iter()
        .filter(|codec| !codec.is_rtx())
        .find_map(|codec| {
            capabilities
                .codecs
                .iter()
                .find(|capability| !capability.is_rtx() && codecs_match(codec, *capability))
                .map(|capability| (codec, capability))
        })
        .ok_or(Error::new_consumer(
            "Remote capabilities do not support any producer codec".to_owned(),
            ConsumerErrorKind::CapabilityMismatchError,
        ))?;

    let mut media_codec = codec.clone();
    media_codec
        .rtcp_feedback
        .retain(|feedback| capability.rtcp_feedback.contains(feedback));

    let supports_rtx = capabilities.codecs.iter().any(|codec| codec.is_rtx());
    let rtx_codec = if supports_rtx {
        consumable
            .codecs
            .iter()
            .find(|rtx| rtx.is_rtx() && rtx.apt() == Some(media_codec.payload_type))
            .cloned()
    } else {
        None
    };

    let encoding = RtpEncodingParameters {
        ssrc: Some(generate_ssrc()),
        rtx: rtx_codec.as_ref().map(|_| RtxParameters {
            ssrc: generate_ssrc(),
        }),
        ..Default::default()
    };

    let mut codecs = vec![media_codec];
    codecs.extend(rtx_codec);

    let header_extensions = consumable
        .header_extensions
        .iter()
        .filter(|extension| {
            capabilities
                .header_extensions
                .iter()
                .any(|supported| supported.uri == extension.uri)
        })
        .cloned()
        .collect();

    Ok(RtpParameters {
        mid: None,
        codecs,
        header_extensions,
        encodings: vec![encoding],
        rtcp: RtcpParameters {
            cname: consumable.rtcp.cname.clone(),
            reduced_size: true,
        },
    })
}

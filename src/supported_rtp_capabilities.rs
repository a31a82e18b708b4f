use crate::rtp_parameters::{
    CodecParameters, MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability,
    RtpHeaderExtension, RtpHeaderExtensionDirection,
};

fn codec(
    kind: MediaKind,
    mime_type: &str,
    preferred_payload_type: Option<u8>,
    clock_rate: u32,
    channels: Option<u8>,
    parameters: CodecParameters,
    rtcp_feedback: Vec<RtcpFeedback>,
) -> RtpCodecCapability {
    RtpCodecCapability {
        kind,
        mime_type: mime_type.to_owned(),
        preferred_payload_type,
        clock_rate,
        channels,
        parameters,
        rtcp_feedback,
    }
}

fn video_feedback() -> Vec<RtcpFeedback> {
    vec![
        RtcpFeedback::new("nack", ""),
        RtcpFeedback::new("nack", "pli"),
        RtcpFeedback::new("ccm", "fir"),
        RtcpFeedback::new("goog-remb", ""),
        RtcpFeedback::new("transport-cc", ""),
    ]
}

fn header_extension(kind: MediaKind, uri: &str, preferred_id: u8) -> RtpHeaderExtension {
    RtpHeaderExtension {
        kind,
        uri: uri.to_owned(),
        preferred_id,
        preferred_encrypt: false,
        direction: RtpHeaderExtensionDirection::Sendrecv,
    }
}

/// Codecs and header extensions a router may be configured with.
/// Payload types are only set for codecs with a static assignment.
pub fn supported_rtp_capabilities() -> RtpCapabilities {
    let mut h264_parameters = CodecParameters::new();
    h264_parameters.insert("packetization-mode".to_owned(), 1.into());
    h264_parameters.insert("level-asymmetry-allowed".to_owned(), 1.into());

    RtpCapabilities {
        codecs: vec![
            codec(
                MediaKind::Audio,
                "audio/opus",
                None,
                48000,
                Some(2),
                CodecParameters::new(),
                vec![RtcpFeedback::new("nack", ""), RtcpFeedback::new("transport-cc", "")],
            ),
            codec(
                MediaKind::Audio,
                "audio/PCMU",
                Some(0),
                8000,
                Some(1),
                CodecParameters::new(),
                vec![RtcpFeedback::new("transport-cc", "")],
            ),
            codec(
                MediaKind::Audio,
                "audio/PCMA",
                Some(8),
                8000,
                Some(1),
                CodecParameters::new(),
                vec![RtcpFeedback::new("transport-cc", "")],
            ),
            codec(
                MediaKind::Audio,
                "audio/G722",
                Some(9),
                8000,
                Some(1),
                CodecParameters::new(),
                vec![RtcpFeedback::new("transport-cc", "")],
            ),
            codec(
                MediaKind::Video,
                "video/VP8",
                None,
                90000,
                None,
                CodecParameters::new(),
                video_feedback(),
            ),
            codec(
                MediaKind::Video,
                "video/VP9",
                None,
                90000,
                None,
                CodecParameters::new(),
                video_feedback(),
            ),
            codec(
                MediaKind::Video,
                "video/H264",
                None,
                90000,
                None,
                h264_parameters,
                video_feedback(),
            ),
            codec(
                MediaKind::Video,
                "video/AV1",
                None,
                90000,
                None,
                CodecParameters::new(),
                video_feedback(),
            ),
        ],
        header_extensions: vec![
            header_extension(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
            header_extension(MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
            header_extension(
                MediaKind::Audio,
                "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
                4,
            ),
            header_extension(
                MediaKind::Video,
                "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
                4,
            ),
            header_extension(
                MediaKind::Video,
                "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
                5,
            ),
            header_extension(MediaKind::Audio, "urn:ietf:params:rtp-hdrext:ssrc-audio-level", 10),
        ],
    }
}

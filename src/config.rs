use std::{
    env,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
    time::Duration,
};

use crate::{
    error::{ConfigErrorKind, Error},
    rtp_parameters::{CodecParameters, MediaKind, RtpCodecCapability},
};

/// Codecs a router is created with.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        let mut vp8_parameters = CodecParameters::new();
        vp8_parameters.insert("x-google-start-bitrate".to_owned(), 1000.into());

        Self {
            media_codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_owned(),
                    preferred_payload_type: None,
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: CodecParameters::new(),
                    rtcp_feedback: vec![],
                },
                RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_owned(),
                    preferred_payload_type: None,
                    clock_rate: 90000,
                    channels: None,
                    parameters: vp8_parameters,
                    rtcp_feedback: vec![],
                },
            ],
        }
    }
}

/// Range of ports transports are bound to. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub port_range: PortRange,
    /// How long the process keeps running after the worker died.
    pub died_grace_period: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange {
                min: 2000,
                max: 2020,
            },
            died_grace_period: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenIp {
    pub ip: IpAddr,
    /// Address advertised in ICE candidates instead of `ip`.
    pub announced_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumSctpStreams {
    pub os: u16,
    pub mis: u16,
}

/// Options used by [`crate::router::Router::create_webrtc_transport`].
#[derive(Debug, Clone)]
pub struct WebRTCTransportConfig {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub minimum_available_outgoing_bitrate: u32,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                announced_ip: None,
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            minimum_available_outgoing_bitrate: 600_000,
            enable_sctp: true,
            num_sctp_streams: NumSctpStreams {
                os: 1024,
                mis: 1024,
            },
            max_sctp_message_size: 262_144,
        }
    }
}

/// Everything the signaling server needs at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub worker: WorkerConfig,
    pub transport: WebRTCTransportConfig,
    pub media: MediaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4004,
            worker: WorkerConfig::default(),
            transport: WebRTCTransportConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads `PORT`, `LISTEN_IP`, `EXTERNAL_IP`, `RTC_MIN_PORT`, `RTC_MAX_PORT`
    /// and `WORKER_DIED_GRACE_MS`. Unset variables keep their default.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse_var(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(min) = parse_var(&lookup, "RTC_MIN_PORT")? {
            config.worker.port_range.min = min;
        }
        if let Some(max) = parse_var(&lookup, "RTC_MAX_PORT")? {
            config.worker.port_range.max = max;
        }
        if let Some(millis) = parse_var::<u64, _>(&lookup, "WORKER_DIED_GRACE_MS")? {
            config.worker.died_grace_period = Duration::from_millis(millis);
        }

        let listen_ip = parse_var(&lookup, "LISTEN_IP")?;
        let announced_ip = parse_var(&lookup, "EXTERNAL_IP")?;
        for listen in config.transport.listen_ips.iter_mut() {
            if let Some(ip) = listen_ip {
                listen.ip = ip;
            }
            listen.announced_ip = announced_ip;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let range = self.worker.port_range;
        if range.min > range.max {
            return Err(Error::new_config(
                format!("RTC port range {}-{} is empty", range.min, range.max),
                ConfigErrorKind::InvalidPortRangeError,
            ));
        }
        if self.media.media_codecs.is_empty() {
            return Err(Error::new_config(
                "At least one media codec is required".to_owned(),
                ConfigErrorKind::InvalidValueError,
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value.trim().parse::<T>().map(Some).map_err(|_| {
            Error::new_config(
                format!("Failed to parse {}: {}", key, value),
                ConfigErrorKind::InvalidValueError,
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::ErrorKind;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 4004);
        assert_eq!(config.worker.port_range, PortRange { min: 2000, max: 2020 });
        assert_eq!(config.worker.died_grace_period, Duration::from_secs(2));
        assert_eq!(config.transport.listen_ips.len(), 1);
        assert_eq!(config.transport.listen_ips[0].announced_ip, None);
        assert!(config.transport.prefer_udp);
        assert_eq!(config.transport.max_sctp_message_size, 262_144);
        assert_eq!(config.media.media_codecs.len(), 2);
    }

    #[test]
    fn reads_variables() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8443"),
            ("EXTERNAL_IP", "203.0.113.7"),
            ("LISTEN_IP", "10.0.0.2"),
            ("RTC_MIN_PORT", "40000"),
            ("RTC_MAX_PORT", "40100"),
            ("WORKER_DIED_GRACE_MS", "10"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8443);
        assert_eq!(
            config.transport.listen_ips[0],
            ListenIp {
                ip: "10.0.0.2".parse().unwrap(),
                announced_ip: Some("203.0.113.7".parse().unwrap()),
            }
        );
        assert_eq!(config.worker.port_range, PortRange { min: 40000, max: 40100 });
        assert_eq!(config.worker.died_grace_period, Duration::from_millis(10));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigError(ConfigErrorKind::InvalidValueError));

        let err = ServerConfig::from_lookup(lookup(&[("EXTERNAL_IP", "example.com")])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigError(ConfigErrorKind::InvalidValueError));

        let err = ServerConfig::from_lookup(lookup(&[
            ("RTC_MIN_PORT", "3000"),
            ("RTC_MAX_PORT", "2000"),
        ]))
        .unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::ConfigError(ConfigErrorKind::InvalidPortRangeError)
        );
    }
}

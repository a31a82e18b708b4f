#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # vcroom
//! Signaling and session orchestration for an SFU-style WebRTC media server.
//! Clients join a room, create a producing and a consuming transport, publish
//! media through a producer and receive the media of others through consumers.
//! This crate does not ship a transport of its own, bind [`signaling::connection::serve`]
//! to any text channel such as a WebSocket.
//! `demos/signaling_server.rs` is an example server built on actix-web.

/// Configuration for [`worker::Worker`], [`router::Router`] and [`webrtc_transport::WebRtcTransport`].
pub mod config;
/// Receives media of a producer on behalf of a client.
pub mod consumer;
pub mod error;
mod ortc;
/// Media published by a client.
pub mod producer;
/// Process-wide worker and per-room media resources.
pub mod registry;
/// Rooms and their peers.
pub mod room;
/// Router is a module that determines which media to distribute to whom.
pub mod router;
pub mod rtp_parameters;
/// State of one connected client.
pub mod session;
/// JSON signaling over any text channel.
pub mod signaling;
pub mod stats;
pub mod supported_rtp_capabilities;
pub mod transport_parameters;
mod utils;
/// Transport negotiated with one client, carrying either its producer or its consumers.
pub mod webrtc_transport;
/// Worker is a module that manages multiple routers.
pub mod worker;

pub use ortc::can_consume;

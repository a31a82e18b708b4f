use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, Mutex};

use crate::{
    config::{MediaConfig, WebRTCTransportConfig},
    registry::{Registry, SharedWorker},
    signaling::message::{Notification, SendingMessage},
};

/// Directory of rooms. All rooms share one worker; each has its own router.
#[derive(Debug)]
pub struct RoomOwner {
    rooms: HashMap<String, Arc<Room>>,
    worker: Arc<SharedWorker>,
    media_config: MediaConfig,
    transport_config: WebRTCTransportConfig,
}

impl RoomOwner {
    pub fn new(
        worker: Arc<SharedWorker>,
        media_config: MediaConfig,
        transport_config: WebRTCTransportConfig,
    ) -> Self {
        RoomOwner {
            rooms: HashMap::new(),
            worker,
            media_config,
            transport_config,
        }
    }

    pub fn find_by_id(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.get(id).cloned()
    }

    /// A room whose router was closed is replaced by a fresh one.
    pub fn get_or_create(&mut self, id: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.get(id) {
            if !room.registry.closed() {
                return room.clone();
            }
            tracing::info!("Room {} is closed, creating it again", id);
        }
        let registry = Registry::new(self.worker.clone(), self.media_config.clone());
        let room = Arc::new(Room::new(
            id.to_owned(),
            registry,
            self.transport_config.clone(),
        ));
        tracing::info!("Room {} is created", id);
        self.rooms.insert(id.to_owned(), room.clone());
        room
    }

    /// Removes the room and closes its router.
    pub async fn remove_room(&mut self, id: &str) {
        if let Some(room) = self.rooms.remove(id) {
            room.registry.close().await;
            tracing::info!("Room {} is removed", id);
        }
    }

    /// Removes the room when no peer is left in it. Peers must join while
    /// the owner is held, so nobody can slip into a room being removed.
    pub async fn remove_if_empty(&mut self, id: &str) -> bool {
        let Some(room) = self.rooms.get(id) else {
            return false;
        };
        if room.peer_count().await > 0 {
            return false;
        }
        self.remove_room(id).await;
        true
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// Sessions connected to the same logical room.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub registry: Registry,
    pub transport_config: WebRTCTransportConfig,
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<SendingMessage>>>,
}

impl Room {
    pub fn new(id: String, registry: Registry, transport_config: WebRTCTransportConfig) -> Self {
        Self {
            id,
            registry,
            transport_config,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn add_peer(&self, session_id: String, sender: mpsc::UnboundedSender<SendingMessage>) {
        let mut peers = self.peers.lock().await;
        peers.insert(session_id, sender);
    }

    /// Returns the number of remaining peers.
    pub async fn remove_peer(&self, session_id: &str) -> usize {
        let mut peers = self.peers.lock().await;
        peers.remove(session_id);
        peers.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Sends a notification to every peer except `except`.
    pub async fn broadcast(&self, except: &str, notification: Notification) {
        let peers = self.peers.lock().await;
        for (session_id, sender) in peers.iter().filter(|(id, _)| id.as_str() != except) {
            if sender
                .send(SendingMessage::Notification(notification.clone()))
                .is_err()
            {
                tracing::warn!("Peer {} in room {} is gone", session_id, self.id);
            }
        }
    }
}

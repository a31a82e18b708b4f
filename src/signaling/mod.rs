/// Per-connection message loop.
pub mod connection;
/// Maps each client event to a session operation.
pub mod handler;
/// Wire format of client requests, responses and notifications.
pub mod message;

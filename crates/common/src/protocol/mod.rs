// Wire protocol for the colloquy chat service.

pub mod message;
pub mod routing;

/// MIME type of message payloads.
pub const DATA_MIME_TYPE: &str = "application/json";

/// MIME type of the per-request routing metadata.
pub const ROUTING_MIME_TYPE: &str = "message/x.rsocket.routing.v0";

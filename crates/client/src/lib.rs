// colloquy-client: session core for the colloquy chat client.

pub mod config;
pub mod session;
pub mod transport;

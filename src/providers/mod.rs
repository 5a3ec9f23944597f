pub mod memory;
pub mod websocket;

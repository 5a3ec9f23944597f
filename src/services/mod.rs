pub mod connection;
pub mod events;
pub mod heartbeat;
pub mod hub;

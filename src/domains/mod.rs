pub mod envelope;
pub mod message;

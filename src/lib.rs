pub mod config;
pub mod daemon;
pub mod domains;
pub mod error;
pub mod interfaces;
pub mod providers;
pub mod services;

pub use crate::config::{Config, ConnectionSettings};
pub use crate::domains::envelope::{Envelope, MessageType, SERVER};
pub use crate::domains::message::{Message, MessageState, Rejection, Reply, Snapshot};
pub use crate::error::{HubError, Result};
pub use crate::interfaces::transport::{Connector, Transport, TransportEvent, TransportHandle};
pub use crate::services::connection::{Connection, ConnectionEvent, SendOptions};
pub use crate::services::hub::{Forward, Hub, HubEvent, RouteHook};

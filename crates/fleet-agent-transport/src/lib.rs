//! Registration and the persistent session to the fleet manager.
//!
//! Provides:
//! - Wire frames exchanged with the manager
//! - Device registration over HTTPS
//! - The connection engine keeping the device connected
//! - WebSocket session (feature: websocket)

pub mod backoff;
pub mod channel;
pub mod engine;
pub mod identity;
pub mod protocol;
pub mod registration;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{Channel, ChannelError, ConnectionError, Connector};
pub use engine::{ConnectionEngine, EngineExit, EngineState, PendingReplies};
pub use identity::DeviceIdentity;
pub use protocol::{InboundFrame, OutboundFrame};
pub use registration::{HttpRegistrar, RegistrationError, Registrar};

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;

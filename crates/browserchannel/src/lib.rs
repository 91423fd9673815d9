#![doc = include_str!("../README.md")]

mod back_channel;
mod channel;
mod error;
mod handler;
mod map_queue;
mod session_id;

pub use channel::{Array, Channel, Timeouts};
pub use error::Error;
pub use handler::{
    BrowserChannelServer, CrossDomainConfig, DEFAULT_BIND_PATH, DEFAULT_TEST_PATH, ServerConfig,
    SUPPORTED_PROTOCOL_VERSION,
};
pub use map_queue::Map;
pub use session_id::SessionId;

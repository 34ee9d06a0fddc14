pub mod config;
pub mod errors;
pub mod input;
pub mod types;

pub use config::{RetryPolicy, ServerParams, SessionConfig};
pub use errors::{BridgeError, DecoderError, DroidLinkError, TransportError};
pub use input::{InputEvent, Key, MouseButton};
pub use types::*;

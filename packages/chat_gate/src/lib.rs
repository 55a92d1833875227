//! Access gate for chat connections: turns presented credentials into an
//! [`Identity`](chat_log::Identity) plus a capability token that allows
//! nothing but the chat entry point.

pub mod capability;
pub mod credentials;
pub mod error;
pub mod gate;

pub use capability::{ChannelRequest, RestrictedCapabilities};
pub use credentials::{CredentialStore, hash_secret};
pub use error::{ErrorResponse, GateError};
pub use gate::{AccessGate, Admission, Credentials};

//! Channel requests and the restriction attached to every admitted connection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// Something a connection asks to do once authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelRequest {
    /// Run the chat entry point. The only thing a chat identity may do.
    EntryPoint,
    Shell,
    Exec { command: String },
    PortForward { host: String, port: u16 },
    AgentForward,
    X11,
}

impl fmt::Display for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryPoint => write!(f, "entry point"),
            Self::Shell => write!(f, "shell"),
            Self::Exec { .. } => write!(f, "exec"),
            Self::PortForward { host, port } => write!(f, "port forward to {host}:{port}"),
            Self::AgentForward => write!(f, "agent forward"),
            Self::X11 => write!(f, "x11"),
        }
    }
}

/// Capability token carried by an admitted connection.
///
/// Chat identities hold `entry_point` and nothing else. The broker checks
/// the token again when attaching instead of trusting ambient permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictedCapabilities {
    pub entry_point: bool,
    pub shell: bool,
    pub exec: bool,
    pub port_forward: bool,
    pub agent_forward: bool,
    pub x11: bool,
}

impl RestrictedCapabilities {
    /// Entry point only.
    pub const fn chat_only() -> Self {
        Self {
            entry_point: true,
            shell: false,
            exec: false,
            port_forward: false,
            agent_forward: false,
            x11: false,
        }
    }

    pub fn permits(&self, request: &ChannelRequest) -> bool {
        match request {
            ChannelRequest::EntryPoint => self.entry_point,
            ChannelRequest::Shell => self.shell,
            ChannelRequest::Exec { .. } => self.exec,
            ChannelRequest::PortForward { .. } => self.port_forward,
            ChannelRequest::AgentForward => self.agent_forward,
            ChannelRequest::X11 => self.x11,
        }
    }

    pub fn require(&self, request: &ChannelRequest) -> Result<(), GateError> {
        if self.permits(request) {
            Ok(())
        } else {
            Err(GateError::CapabilityDenied {
                request: request.to_string(),
            })
        }
    }
}

impl Default for RestrictedCapabilities {
    fn default() -> Self {
        Self::chat_only()
    }
}

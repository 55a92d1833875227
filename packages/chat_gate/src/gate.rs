use std::fmt;

use chat_log::Identity;
use tracing::{info, warn};

use crate::capability::{ChannelRequest, RestrictedCapabilities};
use crate::credentials::CredentialStore;
use crate::error::GateError;

/// What a connecting client presents.
#[derive(Clone)]
pub struct Credentials {
    pub identity: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A connection that passed the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub identity: Identity,
    pub capabilities: RestrictedCapabilities,
}

/// Authenticates connections and pins them to the chat entry point.
#[derive(Debug, Clone)]
pub struct AccessGate {
    store: CredentialStore,
}

impl AccessGate {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }

    /// Check credentials only. Malformed identities fail the same way as
    /// wrong secrets.
    pub fn authenticate(&self, credentials: &Credentials) -> Result<Identity, GateError> {
        let identity = Identity::parse(&credentials.identity)
            .map_err(|_| GateError::unauthorized("malformed identity"))?;

        if self.store.verify(&identity, &credentials.secret) {
            Ok(identity)
        } else {
            Err(GateError::unauthorized(format!(
                "bad credentials for {identity}"
            )))
        }
    }

    /// Authenticate, then check every requested channel against the chat
    /// restriction. No requests means the entry point.
    pub fn admit(
        &self,
        credentials: &Credentials,
        requests: &[ChannelRequest],
    ) -> Result<Admission, GateError> {
        let identity = match self.authenticate(credentials) {
            Ok(identity) => identity,
            Err(e) => {
                if let GateError::Unauthorized { reason } = &e {
                    warn!("Rejected connection: {}", reason);
                }
                return Err(e);
            }
        };

        let capabilities = RestrictedCapabilities::chat_only();
        for request in requests {
            if let Err(e) = capabilities.require(request) {
                warn!("Denied {} for {}", request, identity);
                return Err(e);
            }
        }

        info!("Admitted {}", identity);
        Ok(Admission {
            identity,
            capabilities,
        })
    }
}

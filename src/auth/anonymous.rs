//! ANONYMOUS mechanism.
//!
//! The client sends an optional trace string; the server completes
//! immediately with the `anonymous` authorization id. Deny-list this
//! mechanism on endpoints that require real credentials.

use crate::error::Result;

use super::{ClientMechanism, MechanismProvider, ServerMechanism, ServerStep};

pub(crate) const MECHANISM: &str = "ANONYMOUS";

/// Provider for the ANONYMOUS mechanism.
#[derive(Debug, Clone, Default)]
pub struct AnonymousMechanism {
    trace: Option<String>,
}

impl AnonymousMechanism {
    /// Create a provider with no trace string.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a trace string sent by the client (not trusted as identity).
    pub fn with_trace(trace: impl Into<String>) -> Self {
        Self {
            trace: Some(trace.into()),
        }
    }
}

impl MechanismProvider for AnonymousMechanism {
    fn mechanism(&self) -> &str {
        MECHANISM
    }

    fn create_client(&self) -> Result<Box<dyn ClientMechanism>> {
        Ok(Box::new(AnonymousClient {
            trace: self.trace.clone(),
        }))
    }

    fn create_server(&self) -> Result<Box<dyn ServerMechanism>> {
        Ok(Box::new(AnonymousServer))
    }
}

struct AnonymousClient {
    trace: Option<String>,
}

impl ClientMechanism for AnonymousClient {
    fn mechanism(&self) -> &str {
        MECHANISM
    }

    fn initial_response(&mut self) -> Result<Vec<u8>> {
        Ok(self.trace.as_deref().unwrap_or("").as_bytes().to_vec())
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(crate::error::Error::Authentication(
            "ANONYMOUS expects no challenge".into(),
        ))
    }

    fn authorization_id(&self) -> String {
        "anonymous".into()
    }
}

struct AnonymousServer;

impl ServerMechanism for AnonymousServer {
    fn mechanism(&self) -> &str {
        MECHANISM
    }

    fn evaluate_response(&mut self, response: &[u8]) -> Result<ServerStep> {
        if let Ok(trace) = std::str::from_utf8(response) {
            if !trace.is_empty() {
                tracing::debug!(trace, "anonymous login");
            }
        }
        Ok(ServerStep::Complete {
            authorization_id: "anonymous".into(),
            final_data: Vec::new(),
        })
    }
}

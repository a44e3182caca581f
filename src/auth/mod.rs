//! Pluggable authentication mechanisms.
//!
//! A SASL-compatible contract: a mechanism name plus a provider that
//! produces per-attempt engines. The client engine emits an initial
//! response and evaluates challenges; the server engine evaluates
//! responses and decides whether to challenge again, complete with an
//! authorization id, or fail. Negotiation drives the exchange and bounds
//! its length; mechanisms only compute bytes.

mod anonymous;
mod hmac;

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::EndpointConfig;
use crate::error::Result;

pub use anonymous::AnonymousMechanism;
pub use hmac::HmacSha256Mechanism;

/// Outcome of one server-side evaluation step.
#[derive(Debug)]
pub enum ServerStep {
    /// Send this challenge and wait for another response.
    Challenge(Vec<u8>),
    /// Authentication succeeded.
    Complete {
        /// Authorization id the connection will carry as its principal.
        authorization_id: String,
        /// Mechanism final data returned to the client (may be empty).
        final_data: Vec<u8>,
    },
    /// This attempt failed; negotiation may retry with another mechanism.
    Failed(String),
}

/// Client-side engine for one authentication attempt.
pub trait ClientMechanism: Send {
    /// Mechanism name, e.g. `"HMAC-SHA256"`.
    fn mechanism(&self) -> &str;

    /// Initial response sent with the auth request.
    fn initial_response(&mut self) -> Result<Vec<u8>>;

    /// Evaluate a server challenge, producing the next response.
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Verify the server's final data on completion.
    fn handle_completion(&mut self, final_data: &[u8]) -> Result<()> {
        let _ = final_data;
        Ok(())
    }

    /// Authorization id this engine authenticated as, once complete.
    fn authorization_id(&self) -> String;
}

/// Server-side engine for one authentication attempt.
pub trait ServerMechanism: Send {
    /// Mechanism name.
    fn mechanism(&self) -> &str;

    /// Evaluate a client response (the initial response first).
    fn evaluate_response(&mut self, response: &[u8]) -> Result<ServerStep>;
}

/// Factory producing engines for one mechanism.
pub trait MechanismProvider: Send + Sync {
    /// Mechanism name this provider implements.
    fn mechanism(&self) -> &str;

    /// Create a client-side engine for one attempt.
    fn create_client(&self) -> Result<Box<dyn ClientMechanism>>;

    /// Create a server-side engine for one attempt.
    fn create_server(&self) -> Result<Box<dyn ServerMechanism>>;
}

/// Ordered registry of mechanism providers.
///
/// Order matters: capabilities advertise mechanisms in registration order,
/// and the initiator picks the first mutually acceptable one.
#[derive(Clone, Default)]
pub struct MechanismRegistry {
    providers: Vec<Arc<dyn MechanismProvider>>,
}

impl MechanismRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. A later registration with the same name wins.
    pub fn register(&mut self, provider: Arc<dyn MechanismProvider>) {
        self.providers
            .retain(|p| p.mechanism() != provider.mechanism());
        self.providers.push(provider);
    }

    /// Look up a provider by mechanism name.
    pub fn provider(&self, mechanism: &str) -> Option<Arc<dyn MechanismProvider>> {
        self.providers
            .iter()
            .find(|p| p.mechanism() == mechanism)
            .cloned()
    }

    /// Mechanism names to advertise: registered, permitted by local
    /// policy, and not already tried-and-failed on this connection.
    ///
    /// A mechanism on the deny-list is never offered even when a provider
    /// supports it.
    pub fn offered(&self, config: &EndpointConfig, failed: &HashSet<String>) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.mechanism().to_string())
            .filter(|m| config.mechanism_permitted(m) && !failed.contains(m))
            .collect()
    }

    /// Whether any provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MechanismRegistry")
            .field(
                "mechanisms",
                &self
                    .providers
                    .iter()
                    .map(|p| p.mechanism())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MechanismRegistry {
        let mut reg = MechanismRegistry::new();
        reg.register(Arc::new(HmacSha256Mechanism::new("alice", "s3cret")));
        reg.register(Arc::new(AnonymousMechanism::new()));
        reg
    }

    #[test]
    fn test_registration_order_preserved() {
        let reg = registry();
        let offered = reg.offered(&EndpointConfig::default(), &HashSet::new());
        assert_eq!(offered, vec!["HMAC-SHA256", "ANONYMOUS"]);
    }

    #[test]
    fn test_denied_mechanism_never_offered() {
        let reg = registry();
        let config = EndpointConfig::new().deny_mechanism("ANONYMOUS");
        let offered = reg.offered(&config, &HashSet::new());
        assert_eq!(offered, vec!["HMAC-SHA256"]);
    }

    #[test]
    fn test_allow_list_filters_offers() {
        let reg = registry();
        let config = EndpointConfig::new().allow_mechanisms(["ANONYMOUS"]);
        let offered = reg.offered(&config, &HashSet::new());
        assert_eq!(offered, vec!["ANONYMOUS"]);
    }

    #[test]
    fn test_failed_mechanisms_excluded() {
        let reg = registry();
        let failed: HashSet<String> = ["HMAC-SHA256".to_string()].into_iter().collect();
        let offered = reg.offered(&EndpointConfig::default(), &failed);
        assert_eq!(offered, vec!["ANONYMOUS"]);
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut reg = registry();
        reg.register(Arc::new(AnonymousMechanism::new()));
        let offered = reg.offered(&EndpointConfig::default(), &HashSet::new());
        assert_eq!(offered, vec!["HMAC-SHA256", "ANONYMOUS"]);
    }
}

//! Service registry: maps channel-open service names to listeners.
//!
//! A listener is invoked (off the read path, on its own task) whenever a
//! peer opens a channel for the registered name. Opens for unregistered
//! names are refused and no channel is created on either side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::channel::Channel;
use crate::rpc::{self, InvocationHandler};

/// Callback invoked when a channel opens for a registered service.
pub trait OpenListener: Send + Sync + 'static {
    /// Take ownership of the accepted channel.
    fn channel_opened(&self, channel: Channel);
}

impl<F> OpenListener for F
where
    F: Fn(Channel) + Send + Sync + 'static,
{
    fn channel_opened(&self, channel: Channel) {
        self(channel)
    }
}

/// Registry of service names to open listeners.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<Mutex<HashMap<String, Arc<dyn OpenListener>>>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, listener: Arc<dyn OpenListener>) {
        self.services
            .lock()
            .expect("services lock")
            .insert(name.into(), listener);
    }

    /// Register an invocation handler for `name`.
    ///
    /// Every channel opened for the service is served by the request/reply
    /// dispatcher over `handler`.
    pub fn register_invocations(&self, name: impl Into<String>, handler: Arc<dyn InvocationHandler>) {
        self.register(
            name,
            Arc::new(move |channel: Channel| {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = rpc::serve(channel, handler).await {
                        tracing::debug!(error = %e, "invocation dispatch ended");
                    }
                });
            }),
        );
    }

    /// Remove a service registration.
    pub fn unregister(&self, name: &str) -> bool {
        self.services
            .lock()
            .expect("services lock")
            .remove(name)
            .is_some()
    }

    /// Look up the listener for `name`.
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<dyn OpenListener>> {
        self.services.lock().expect("services lock").get(name).cloned()
    }

    /// Registered service names.
    pub fn names(&self) -> Vec<String> {
        self.services
            .lock()
            .expect("services lock")
            .keys()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = ServiceRegistry::new();
        registry.register("echo", Arc::new(|_channel: Channel| {}));

        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn test_unregister() {
        let registry = ServiceRegistry::new();
        registry.register("echo", Arc::new(|_channel: Channel| {}));

        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert!(registry.lookup("echo").is_none());
    }

    #[test]
    fn test_replacement() {
        let registry = ServiceRegistry::new();
        registry.register("svc", Arc::new(|_channel: Channel| {}));
        registry.register("svc", Arc::new(|_channel: Channel| {}));
        assert_eq!(registry.names(), vec!["svc".to_string()]);
    }
}

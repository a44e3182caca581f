//! Endpoint and channel configuration.
//!
//! Plain structs with a fluent builder surface. Loading these from files or
//! the environment is the caller's concern.

use std::time::Duration;

/// Default per-message flow control window, in bytes.
pub const DEFAULT_WINDOW_SIZE: u32 = 64 * 1024;

/// Default bound on concurrently open messages per channel direction.
pub const DEFAULT_MESSAGE_COUNT: u16 = 16;

/// Default largest payload carried by a single `MessageData` frame.
pub const DEFAULT_MAX_FRAME_PAYLOAD: u32 = 16 * 1024;

/// Default number of times mechanism negotiation may be retried after a
/// rejection before the connection fails.
pub const DEFAULT_AUTH_RETRY_BUDGET: u32 = 3;

/// Default bound on challenge/response turns within one mechanism attempt.
pub const DEFAULT_MAX_AUTH_EXCHANGES: u32 = 8;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Window sizes and message-count bounds requested for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Bytes the peer may send us per message before replenishment.
    pub inbound_window: u32,
    /// Bytes we want to send per message before replenishment.
    pub outbound_window: u32,
    /// Concurrently open inbound messages we accept.
    pub max_inbound_messages: u16,
    /// Concurrently open outbound messages we allow ourselves.
    pub max_outbound_messages: u16,
}

impl ChannelOptions {
    /// Set the inbound window size in bytes.
    pub fn inbound_window(mut self, bytes: u32) -> Self {
        self.inbound_window = bytes;
        self
    }

    /// Set the outbound window size in bytes.
    pub fn outbound_window(mut self, bytes: u32) -> Self {
        self.outbound_window = bytes;
        self
    }

    /// Set the bound on concurrently open inbound messages.
    pub fn max_inbound_messages(mut self, count: u16) -> Self {
        self.max_inbound_messages = count;
        self
    }

    /// Set the bound on concurrently open outbound messages.
    pub fn max_outbound_messages(mut self, count: u16) -> Self {
        self.max_outbound_messages = count;
        self
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            inbound_window: DEFAULT_WINDOW_SIZE,
            outbound_window: DEFAULT_WINDOW_SIZE,
            max_inbound_messages: DEFAULT_MESSAGE_COUNT,
            max_outbound_messages: DEFAULT_MESSAGE_COUNT,
        }
    }
}

/// Configuration for an [`Endpoint`](crate::Endpoint).
///
/// Applies symmetrically to the initiator and acceptor roles.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Name advertised in the greeting when acting as acceptor.
    pub name: Option<String>,
    /// Mechanisms that may be offered or selected. `None` means any
    /// registered mechanism.
    pub allowed_mechanisms: Option<Vec<String>>,
    /// Mechanisms that must never be offered or selected, even when a
    /// provider is registered.
    pub disallowed_mechanisms: Vec<String>,
    /// Refuse the transport-security upgrade even when the peer offers it.
    pub forbid_tls: bool,
    /// Times mechanism negotiation may re-enter capability selection after
    /// a rejection.
    pub auth_retry_budget: u32,
    /// Bound on challenge/response turns for one mechanism attempt.
    pub max_auth_exchanges: u32,
    /// Interval between `ConnectionAlive` heartbeat frames.
    pub heartbeat_interval: Duration,
    /// Largest payload carried by one `MessageData` frame.
    pub max_frame_payload: u32,
    /// Window defaults applied to accepted channels.
    pub channel: ChannelOptions,
}

impl EndpointConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the acceptor-side greeting name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Restrict offered/selected mechanisms to an allow-list.
    pub fn allow_mechanisms<I, S>(mut self, mechs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_mechanisms = Some(mechs.into_iter().map(Into::into).collect());
        self
    }

    /// Add a mechanism to the deny-list.
    pub fn deny_mechanism(mut self, mech: impl Into<String>) -> Self {
        self.disallowed_mechanisms.push(mech.into());
        self
    }

    /// Never request or offer the transport-security upgrade.
    pub fn forbid_tls(mut self) -> Self {
        self.forbid_tls = true;
        self
    }

    /// Set the mechanism-retry budget.
    pub fn auth_retry_budget(mut self, budget: u32) -> Self {
        self.auth_retry_budget = budget;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the largest single-frame payload size.
    pub fn max_frame_payload(mut self, bytes: u32) -> Self {
        self.max_frame_payload = bytes;
        self
    }

    /// Set the window defaults applied to accepted channels.
    pub fn channel_options(mut self, options: ChannelOptions) -> Self {
        self.channel = options;
        self
    }

    /// Whether local policy permits `mech` to be offered or selected.
    pub fn mechanism_permitted(&self, mech: &str) -> bool {
        if self.disallowed_mechanisms.iter().any(|m| m == mech) {
            return false;
        }
        match &self.allowed_mechanisms {
            Some(allowed) => allowed.iter().any(|m| m == mech),
            None => true,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: None,
            allowed_mechanisms: None,
            disallowed_mechanisms: Vec::new(),
            forbid_tls: false,
            auth_retry_budget: DEFAULT_AUTH_RETRY_BUDGET,
            max_auth_exchanges: DEFAULT_MAX_AUTH_EXCHANGES,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            channel: ChannelOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EndpointConfig::default();
        assert_eq!(config.auth_retry_budget, DEFAULT_AUTH_RETRY_BUDGET);
        assert_eq!(config.channel.inbound_window, DEFAULT_WINDOW_SIZE);
        assert!(!config.forbid_tls);
        assert!(config.name.is_none());
    }

    #[test]
    fn test_builder_chaining() {
        let config = EndpointConfig::new()
            .name("node-a")
            .deny_mechanism("ANONYMOUS")
            .forbid_tls()
            .auth_retry_budget(1)
            .channel_options(ChannelOptions::default().inbound_window(1024));

        assert_eq!(config.name.as_deref(), Some("node-a"));
        assert!(config.forbid_tls);
        assert_eq!(config.auth_retry_budget, 1);
        assert_eq!(config.channel.inbound_window, 1024);
    }

    #[test]
    fn test_mechanism_policy_deny_wins() {
        let config = EndpointConfig::new()
            .allow_mechanisms(["HMAC-SHA256", "ANONYMOUS"])
            .deny_mechanism("ANONYMOUS");

        assert!(config.mechanism_permitted("HMAC-SHA256"));
        assert!(!config.mechanism_permitted("ANONYMOUS"));
        assert!(!config.mechanism_permitted("PLAIN"));
    }

    #[test]
    fn test_mechanism_policy_open_by_default() {
        let config = EndpointConfig::default();
        assert!(config.mechanism_permitted("HMAC-SHA256"));
    }
}

//! Connection negotiation state machine.
//!
//! Greeting, capability exchange, optional transport-security upgrade, and
//! authentication, driven to completion or failure. The machine is a state
//! enum plus one dispatch function per role switching on `(state, frame)`,
//! with I/O expressed as [`NegotiateAction`] values so every transition is
//! unit testable without a transport.
//!
//! ```text
//! New -> AwaitingGreeting -> AwaitingCapabilities -> [StartTls]
//!     -> AwaitingAuthResponse* -> Authenticated
//! ```
//!
//! `Failed` is reachable from every state; `ConnectionClose` is honored in
//! any pre-authenticated state as a graceful abort.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;

use crate::auth::{ClientMechanism, MechanismRegistry, ServerMechanism, ServerStep};
use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::protocol::{Frame, PROTOCOL_VERSION};

/// Security layer negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLayer {
    /// Plaintext transport.
    None,
    /// A mechanism-provided integrity layer.
    Integrity,
    /// Encrypted transport (STARTTLS upgrade completed).
    Confidentiality,
}

/// Result of a completed negotiation.
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    /// Authenticated authorization id.
    pub principal: String,
    /// Mechanism that produced the principal.
    pub mechanism: String,
    /// Negotiated protocol version.
    pub version: u8,
    /// Name the peer advertised in its greeting, if any.
    pub peer_name: Option<String>,
    /// Security layer in effect.
    pub security: SecurityLayer,
}

/// One step the driver must perform.
#[derive(Debug)]
pub(crate) enum NegotiateAction {
    /// Write this frame to the transport.
    Send(Frame),
    /// Wrap the transport in the TLS layer before continuing.
    UpgradeTls,
    /// Negotiation finished; hand the connection to the multiplexer.
    Complete(NegotiatedSession),
    /// The peer aborted gracefully with `ConnectionClose`.
    PeerClosed,
    /// Authentication is unrecoverable; send nothing further and fail.
    Fail(String),
}

fn unexpected(state: &str, frame: &Frame) -> Error {
    Error::Protocol(format!(
        "unexpected {} frame in {state} state",
        frame.kind()
    ))
}

fn negotiate_version(theirs: u8) -> Result<u8> {
    let version = theirs.min(PROTOCOL_VERSION);
    if version == 0 {
        return Err(Error::Protocol("peer offered protocol version 0".into()));
    }
    Ok(version)
}

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

enum InitiatorState {
    AwaitingGreeting,
    AwaitingCapabilities,
    AwaitingStartTls,
    AwaitingAuthReply {
        engine: Box<dyn ClientMechanism>,
        exchanges: u32,
    },
    Done,
}

/// Initiator-side negotiation machine.
pub(crate) struct InitiatorNegotiator {
    config: Arc<EndpointConfig>,
    registry: MechanismRegistry,
    has_upgrader: bool,
    state: InitiatorState,
    failed: HashSet<String>,
    retries: u32,
    version: u8,
    peer_name: Option<String>,
    tls_active: bool,
}

impl InitiatorNegotiator {
    pub fn new(
        config: Arc<EndpointConfig>,
        registry: MechanismRegistry,
        has_upgrader: bool,
    ) -> Self {
        Self {
            config,
            registry,
            has_upgrader,
            state: InitiatorState::AwaitingGreeting,
            failed: HashSet::new(),
            retries: 0,
            version: PROTOCOL_VERSION,
            peer_name: None,
            tls_active: false,
        }
    }

    fn capabilities(&self) -> Frame {
        Frame::Capabilities {
            version: self.version,
            starttls: false,
            mechanisms: self.registry.offered(&self.config, &self.failed),
        }
    }

    /// Choose the first peer-offered mechanism that local policy permits,
    /// a provider exists for, and that has not already failed.
    fn select_mechanism(&mut self, offered: &[String]) -> Result<Vec<NegotiateAction>> {
        for name in offered {
            if !self.config.mechanism_permitted(name) || self.failed.contains(name) {
                continue;
            }
            let Some(provider) = self.registry.provider(name) else {
                continue;
            };
            let mut engine = provider.create_client()?;
            let initial = engine.initial_response()?;
            tracing::debug!(mechanism = %name, "selected authentication mechanism");
            let request = Frame::AuthRequest {
                mechanism: name.clone(),
                initial_response: Bytes::from(initial),
            };
            self.state = InitiatorState::AwaitingAuthReply {
                engine,
                exchanges: 0,
            };
            return Ok(vec![NegotiateAction::Send(request)]);
        }
        Err(Error::Authentication(
            "no mutually acceptable authentication mechanism".into(),
        ))
    }

    /// Dispatch one inbound frame against the current state.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Vec<NegotiateAction>> {
        if matches!(frame, Frame::ConnectionClose) {
            self.state = InitiatorState::Done;
            return Ok(vec![NegotiateAction::PeerClosed]);
        }
        match std::mem::replace(&mut self.state, InitiatorState::Done) {
            InitiatorState::AwaitingGreeting => match frame {
                Frame::Greeting {
                    version,
                    endpoint_name,
                } => {
                    self.version = negotiate_version(version)?;
                    self.peer_name = endpoint_name;
                    self.state = InitiatorState::AwaitingCapabilities;
                    Ok(vec![NegotiateAction::Send(self.capabilities())])
                }
                other => Err(unexpected("awaiting-greeting", &other)),
            },
            InitiatorState::AwaitingCapabilities => match frame {
                Frame::Capabilities {
                    version,
                    starttls,
                    mechanisms,
                } => {
                    self.version = negotiate_version(version)?;
                    let want_tls = starttls
                        && !self.config.forbid_tls
                        && self.has_upgrader
                        && !self.tls_active;
                    if want_tls {
                        self.state = InitiatorState::AwaitingStartTls;
                        Ok(vec![NegotiateAction::Send(Frame::StartTls)])
                    } else {
                        self.select_mechanism(&mechanisms)
                    }
                }
                other => Err(unexpected("awaiting-capabilities", &other)),
            },
            InitiatorState::AwaitingStartTls => match frame {
                Frame::StartTls => {
                    self.tls_active = true;
                    self.state = InitiatorState::AwaitingCapabilities;
                    // Re-exchange capabilities over the secured transport.
                    Ok(vec![
                        NegotiateAction::UpgradeTls,
                        NegotiateAction::Send(self.capabilities()),
                    ])
                }
                other => Err(unexpected("awaiting-start-tls", &other)),
            },
            InitiatorState::AwaitingAuthReply {
                mut engine,
                exchanges,
            } => match frame {
                Frame::AuthChallenge { challenge } => {
                    let exchanges = exchanges + 1;
                    if exchanges > self.config.max_auth_exchanges {
                        return Err(Error::Authentication(format!(
                            "mechanism {} exceeded {} challenge/response exchanges",
                            engine.mechanism(),
                            self.config.max_auth_exchanges
                        )));
                    }
                    let response = engine.evaluate_challenge(&challenge)?;
                    self.state = InitiatorState::AwaitingAuthReply { engine, exchanges };
                    Ok(vec![NegotiateAction::Send(Frame::AuthResponse {
                        response: Bytes::from(response),
                    })])
                }
                Frame::AuthComplete { challenge } => {
                    engine.handle_completion(&challenge)?;
                    let session = NegotiatedSession {
                        principal: engine.authorization_id(),
                        mechanism: engine.mechanism().to_string(),
                        version: self.version,
                        peer_name: self.peer_name.clone(),
                        security: if self.tls_active {
                            SecurityLayer::Confidentiality
                        } else {
                            SecurityLayer::None
                        },
                    };
                    Ok(vec![NegotiateAction::Complete(session)])
                }
                Frame::AuthRejected { reason } => {
                    let mech = engine.mechanism().to_string();
                    tracing::debug!(mechanism = %mech, %reason, "authentication rejected");
                    self.failed.insert(mech);
                    self.retries += 1;
                    if self.retries > self.config.auth_retry_budget {
                        return Err(Error::Authentication(format!(
                            "retry budget exhausted after rejection: {reason}"
                        )));
                    }
                    self.state = InitiatorState::AwaitingCapabilities;
                    Ok(vec![NegotiateAction::Send(self.capabilities())])
                }
                other => Err(unexpected("awaiting-auth-reply", &other)),
            },
            InitiatorState::Done => Err(unexpected("done", &frame)),
        }
    }
}

// ---------------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------------

enum AcceptorState {
    AwaitingCapabilities,
    AwaitingAuthRequest,
    AwaitingAuthResponse {
        engine: Box<dyn ServerMechanism>,
        exchanges: u32,
    },
    Done,
}

/// Acceptor-side negotiation machine.
pub(crate) struct AcceptorNegotiator {
    config: Arc<EndpointConfig>,
    registry: MechanismRegistry,
    has_upgrader: bool,
    state: AcceptorState,
    failed: HashSet<String>,
    retries: u32,
    version: u8,
    tls_active: bool,
}

impl AcceptorNegotiator {
    pub fn new(
        config: Arc<EndpointConfig>,
        registry: MechanismRegistry,
        has_upgrader: bool,
    ) -> Self {
        Self {
            config,
            registry,
            has_upgrader,
            state: AcceptorState::AwaitingCapabilities,
            failed: HashSet::new(),
            retries: 0,
            version: PROTOCOL_VERSION,
            tls_active: false,
        }
    }

    /// Opening move: the greeting frame, sent before any read.
    pub fn greeting(&self) -> Frame {
        Frame::Greeting {
            version: PROTOCOL_VERSION,
            endpoint_name: self.config.name.clone(),
        }
    }

    fn offers_tls(&self) -> bool {
        self.has_upgrader && !self.config.forbid_tls && !self.tls_active
    }

    fn capabilities(&self) -> Frame {
        Frame::Capabilities {
            version: self.version,
            starttls: self.offers_tls(),
            mechanisms: self.registry.offered(&self.config, &self.failed),
        }
    }

    /// Count one failed attempt; emits a rejection and either re-enters
    /// selection or fails the connection once the budget is spent.
    fn reject(&mut self, mechanism: &str, reason: String) -> Vec<NegotiateAction> {
        self.failed.insert(mechanism.to_string());
        self.retries += 1;
        let rejected = NegotiateAction::Send(Frame::AuthRejected {
            reason: reason.clone(),
        });
        if self.retries > self.config.auth_retry_budget {
            return vec![
                rejected,
                NegotiateAction::Fail(format!("retry budget exhausted: {reason}")),
            ];
        }
        self.state = AcceptorState::AwaitingAuthRequest;
        vec![rejected]
    }

    fn apply_step(
        &mut self,
        mechanism: &str,
        engine: Box<dyn ServerMechanism>,
        step: ServerStep,
        exchanges: u32,
    ) -> Vec<NegotiateAction> {
        match step {
            ServerStep::Challenge(challenge) => {
                self.state = AcceptorState::AwaitingAuthResponse { engine, exchanges };
                vec![NegotiateAction::Send(Frame::AuthChallenge {
                    challenge: Bytes::from(challenge),
                })]
            }
            ServerStep::Complete {
                authorization_id,
                final_data,
            } => {
                tracing::debug!(principal = %authorization_id, mechanism, "peer authenticated");
                let session = NegotiatedSession {
                    principal: authorization_id,
                    mechanism: mechanism.to_string(),
                    version: self.version,
                    peer_name: None,
                    security: if self.tls_active {
                        SecurityLayer::Confidentiality
                    } else {
                        SecurityLayer::None
                    },
                };
                vec![
                    NegotiateAction::Send(Frame::AuthComplete {
                        challenge: Bytes::from(final_data),
                    }),
                    NegotiateAction::Complete(session),
                ]
            }
            ServerStep::Failed(reason) => self.reject(mechanism, reason),
        }
    }

    /// Dispatch one inbound frame against the current state.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Vec<NegotiateAction>> {
        if matches!(frame, Frame::ConnectionClose) {
            self.state = AcceptorState::Done;
            return Ok(vec![NegotiateAction::PeerClosed]);
        }
        match std::mem::replace(&mut self.state, AcceptorState::Done) {
            AcceptorState::AwaitingCapabilities => match frame {
                Frame::Capabilities { version, .. } => {
                    self.version = negotiate_version(version)?;
                    self.state = AcceptorState::AwaitingAuthRequest;
                    Ok(vec![NegotiateAction::Send(self.capabilities())])
                }
                other => Err(unexpected("awaiting-capabilities", &other)),
            },
            AcceptorState::AwaitingAuthRequest => match frame {
                Frame::StartTls => {
                    if !self.offers_tls() {
                        return Err(Error::Protocol(
                            "peer requested start-tls but it was not offered".into(),
                        ));
                    }
                    self.tls_active = true;
                    self.state = AcceptorState::AwaitingCapabilities;
                    // Ack in plaintext, then wrap; the peer re-sends its
                    // capabilities over the secured transport.
                    Ok(vec![
                        NegotiateAction::Send(Frame::StartTls),
                        NegotiateAction::UpgradeTls,
                    ])
                }
                // Rejection re-enters selection: the peer re-sends
                // capabilities from this state.
                Frame::Capabilities { version, .. } => {
                    self.version = negotiate_version(version)?;
                    self.state = AcceptorState::AwaitingAuthRequest;
                    Ok(vec![NegotiateAction::Send(self.capabilities())])
                }
                Frame::AuthRequest {
                    mechanism,
                    initial_response,
                } => {
                    let offered = self.registry.offered(&self.config, &self.failed);
                    if !offered.iter().any(|m| m == &mechanism) {
                        return Ok(self.reject(&mechanism, "mechanism not offered".into()));
                    }
                    let provider = match self.registry.provider(&mechanism) {
                        Some(p) => p,
                        None => {
                            return Ok(self.reject(&mechanism, "mechanism not offered".into()))
                        }
                    };
                    let mut engine = provider.create_server()?;
                    let step = engine.evaluate_response(&initial_response)?;
                    Ok(self.apply_step(&mechanism, engine, step, 0))
                }
                other => Err(unexpected("awaiting-auth-request", &other)),
            },
            AcceptorState::AwaitingAuthResponse {
                mut engine,
                exchanges,
            } => match frame {
                Frame::AuthResponse { response } => {
                    let mechanism = engine.mechanism().to_string();
                    let exchanges = exchanges + 1;
                    if exchanges > self.config.max_auth_exchanges {
                        return Ok(self.reject(
                            &mechanism,
                            format!(
                                "exceeded {} challenge/response exchanges",
                                self.config.max_auth_exchanges
                            ),
                        ));
                    }
                    let step = engine.evaluate_response(&response)?;
                    Ok(self.apply_step(&mechanism, engine, step, exchanges))
                }
                other => Err(unexpected("awaiting-auth-response", &other)),
            },
            AcceptorState::Done => Err(unexpected("done", &frame)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AnonymousMechanism, HmacSha256Mechanism};

    fn registry(username: &str, secret: &str) -> MechanismRegistry {
        let mut reg = MechanismRegistry::new();
        reg.register(Arc::new(HmacSha256Mechanism::new(username, secret)));
        reg.register(Arc::new(AnonymousMechanism::new()));
        reg
    }

    /// Pump frames between the two machines until one completes or fails.
    fn run_handshake(
        mut initiator: InitiatorNegotiator,
        mut acceptor: AcceptorNegotiator,
    ) -> (Result<NegotiatedSession>, Result<NegotiatedSession>) {
        let mut to_initiator = vec![acceptor.greeting()];
        let mut to_acceptor: Vec<Frame> = Vec::new();
        let mut init_result = None;
        let mut acc_result = None;

        for _ in 0..64 {
            if to_initiator.is_empty() && to_acceptor.is_empty() {
                break;
            }
            for frame in std::mem::take(&mut to_initiator) {
                if init_result.is_some() {
                    continue;
                }
                match initiator.on_frame(frame) {
                    Ok(actions) => {
                        for action in actions {
                            match action {
                                NegotiateAction::Send(f) => to_acceptor.push(f),
                                NegotiateAction::Complete(s) => init_result = Some(Ok(s)),
                                NegotiateAction::Fail(msg) => {
                                    init_result = Some(Err(Error::Authentication(msg)))
                                }
                                NegotiateAction::PeerClosed => {
                                    init_result = Some(Err(Error::Closed))
                                }
                                NegotiateAction::UpgradeTls => {}
                            }
                        }
                    }
                    Err(e) => init_result = Some(Err(e)),
                }
            }
            for frame in std::mem::take(&mut to_acceptor) {
                if acc_result.is_some() {
                    continue;
                }
                match acceptor.on_frame(frame) {
                    Ok(actions) => {
                        for action in actions {
                            match action {
                                NegotiateAction::Send(f) => to_initiator.push(f),
                                NegotiateAction::Complete(s) => acc_result = Some(Ok(s)),
                                NegotiateAction::Fail(msg) => {
                                    acc_result = Some(Err(Error::Authentication(msg)))
                                }
                                NegotiateAction::PeerClosed => {
                                    acc_result = Some(Err(Error::Closed))
                                }
                                NegotiateAction::UpgradeTls => {}
                            }
                        }
                    }
                    Err(e) => acc_result = Some(Err(e)),
                }
            }
        }

        (
            init_result.unwrap_or(Err(Error::Indeterminate("handshake stalled".into()))),
            acc_result.unwrap_or(Err(Error::Indeterminate("handshake stalled".into()))),
        )
    }

    #[test]
    fn test_successful_hmac_handshake() {
        let config = Arc::new(EndpointConfig::new().name("server-a"));
        let initiator = InitiatorNegotiator::new(
            Arc::new(EndpointConfig::default()),
            registry("alice", "s3cret"),
            false,
        );
        let acceptor = AcceptorNegotiator::new(config, registry("unused", "s3cret"), false);

        let (init, acc) = run_handshake(initiator, acceptor);
        let init = init.unwrap();
        let acc = acc.unwrap();

        assert_eq!(init.principal, "alice");
        assert_eq!(acc.principal, "alice");
        assert_eq!(init.mechanism, "HMAC-SHA256");
        assert_eq!(init.peer_name.as_deref(), Some("server-a"));
        assert_eq!(init.version, PROTOCOL_VERSION);
        assert_eq!(init.security, SecurityLayer::None);
    }

    #[test]
    fn test_wrong_secret_falls_back_to_anonymous() {
        let initiator = InitiatorNegotiator::new(
            Arc::new(EndpointConfig::default()),
            registry("alice", "wrong"),
            false,
        );
        let acceptor = AcceptorNegotiator::new(
            Arc::new(EndpointConfig::default()),
            registry("unused", "s3cret"),
            false,
        );

        let (init, acc) = run_handshake(initiator, acceptor);
        assert_eq!(init.unwrap().principal, "anonymous");
        assert_eq!(acc.unwrap().mechanism, "ANONYMOUS");
    }

    #[test]
    fn test_retry_budget_exhaustion_is_fatal() {
        let config = Arc::new(EndpointConfig::new().auth_retry_budget(0));
        let mut reg = MechanismRegistry::new();
        reg.register(Arc::new(HmacSha256Mechanism::new("alice", "wrong")));
        let initiator = InitiatorNegotiator::new(config.clone(), reg, false);

        let mut server_reg = MechanismRegistry::new();
        server_reg.register(Arc::new(HmacSha256Mechanism::new("unused", "s3cret")));
        let acceptor = AcceptorNegotiator::new(config, server_reg, false);

        let (init, acc) = run_handshake(initiator, acceptor);
        assert!(matches!(init, Err(Error::Authentication(_))));
        assert!(matches!(acc, Err(Error::Authentication(_))));
    }

    #[test]
    fn test_disallowed_mechanism_not_offered_by_acceptor() {
        let mut acceptor = AcceptorNegotiator::new(
            Arc::new(EndpointConfig::new().deny_mechanism("ANONYMOUS")),
            registry("unused", "s3cret"),
            false,
        );
        let actions = acceptor
            .on_frame(Frame::Capabilities {
                version: PROTOCOL_VERSION,
                starttls: false,
                mechanisms: vec![],
            })
            .unwrap();
        match &actions[0] {
            NegotiateAction::Send(Frame::Capabilities { mechanisms, .. }) => {
                assert_eq!(mechanisms, &vec!["HMAC-SHA256".to_string()]);
            }
            other => panic!("expected capabilities, got {other:?}"),
        }
    }

    #[test]
    fn test_disallowed_mechanism_request_rejected() {
        let mut acceptor = AcceptorNegotiator::new(
            Arc::new(EndpointConfig::new().deny_mechanism("ANONYMOUS")),
            registry("unused", "s3cret"),
            false,
        );
        acceptor
            .on_frame(Frame::Capabilities {
                version: PROTOCOL_VERSION,
                starttls: false,
                mechanisms: vec![],
            })
            .unwrap();
        let actions = acceptor
            .on_frame(Frame::AuthRequest {
                mechanism: "ANONYMOUS".into(),
                initial_response: Bytes::new(),
            })
            .unwrap();
        assert!(matches!(
            actions[0],
            NegotiateAction::Send(Frame::AuthRejected { .. })
        ));
    }

    #[test]
    fn test_unexpected_frame_is_protocol_error() {
        let mut initiator = InitiatorNegotiator::new(
            Arc::new(EndpointConfig::default()),
            registry("alice", "s3cret"),
            false,
        );
        let err = initiator
            .on_frame(Frame::AuthChallenge {
                challenge: Bytes::new(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_connection_close_honored_pre_auth() {
        let mut initiator = InitiatorNegotiator::new(
            Arc::new(EndpointConfig::default()),
            registry("alice", "s3cret"),
            false,
        );
        let actions = initiator.on_frame(Frame::ConnectionClose).unwrap();
        assert!(matches!(actions[0], NegotiateAction::PeerClosed));
    }

    #[test]
    fn test_starttls_requested_when_offered() {
        let mut initiator = InitiatorNegotiator::new(
            Arc::new(EndpointConfig::default()),
            registry("alice", "s3cret"),
            true,
        );
        initiator
            .on_frame(Frame::Greeting {
                version: PROTOCOL_VERSION,
                endpoint_name: None,
            })
            .unwrap();
        let actions = initiator
            .on_frame(Frame::Capabilities {
                version: PROTOCOL_VERSION,
                starttls: true,
                mechanisms: vec!["ANONYMOUS".into()],
            })
            .unwrap();
        assert!(matches!(actions[0], NegotiateAction::Send(Frame::StartTls)));

        // The StartTls ack upgrades and re-sends capabilities.
        let actions = initiator.on_frame(Frame::StartTls).unwrap();
        assert!(matches!(actions[0], NegotiateAction::UpgradeTls));
        assert!(matches!(
            actions[1],
            NegotiateAction::Send(Frame::Capabilities { .. })
        ));
    }

    #[test]
    fn test_starttls_skipped_when_forbidden() {
        let mut initiator = InitiatorNegotiator::new(
            Arc::new(EndpointConfig::new().forbid_tls()),
            registry("alice", "s3cret"),
            true,
        );
        initiator
            .on_frame(Frame::Greeting {
                version: PROTOCOL_VERSION,
                endpoint_name: None,
            })
            .unwrap();
        let actions = initiator
            .on_frame(Frame::Capabilities {
                version: PROTOCOL_VERSION,
                starttls: true,
                mechanisms: vec!["ANONYMOUS".into()],
            })
            .unwrap();
        // Goes straight to auth.
        assert!(matches!(
            actions[0],
            NegotiateAction::Send(Frame::AuthRequest { .. })
        ));
    }

    #[test]
    fn test_uninvited_starttls_is_protocol_error() {
        let mut acceptor = AcceptorNegotiator::new(
            Arc::new(EndpointConfig::new().forbid_tls()),
            registry("unused", "s3cret"),
            true,
        );
        acceptor
            .on_frame(Frame::Capabilities {
                version: PROTOCOL_VERSION,
                starttls: false,
                mechanisms: vec![],
            })
            .unwrap();
        let err = acceptor.on_frame(Frame::StartTls).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_version_negotiated_to_minimum() {
        let mut initiator = InitiatorNegotiator::new(
            Arc::new(EndpointConfig::default()),
            registry("alice", "s3cret"),
            false,
        );
        initiator
            .on_frame(Frame::Greeting {
                version: 7,
                endpoint_name: None,
            })
            .unwrap();
        assert_eq!(initiator.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_version_zero_rejected() {
        let mut initiator = InitiatorNegotiator::new(
            Arc::new(EndpointConfig::default()),
            registry("alice", "s3cret"),
            false,
        );
        assert!(initiator
            .on_frame(Frame::Greeting {
                version: 0,
                endpoint_name: None,
            })
            .is_err());
    }
}

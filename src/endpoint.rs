//! Endpoint: the symmetric entry point for both connection roles.
//!
//! An endpoint carries the configuration, service registry, mechanism
//! registry, and the optional TLS upgrader. `connect` drives the
//! initiator-side negotiation over a supplied transport, `accept` the
//! acceptor side; both yield an authenticated [`Connection`] owned by the
//! endpoint until it closes.
//!
//! Shutdown is two-phase: phase 1 closes every live connection and waits
//! for the lifecycle count to drain; phase 2 then tears down what the
//! endpoint itself owns (registries, connection table) exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::ToSocketAddrs;

use crate::auth::{MechanismProvider, MechanismRegistry};
use crate::config::EndpointConfig;
use crate::connection::{start_connection, Connection, Role};
use crate::error::{Error, Result};
use crate::lifecycle::ResourceTracker;
use crate::negotiate::{
    AcceptorNegotiator, InitiatorNegotiator, NegotiateAction, NegotiatedSession,
};
use crate::protocol::{Frame, FrameBuffer};
use crate::rpc::InvocationHandler;
use crate::service::{OpenListener, ServiceRegistry};
use crate::transport::{self, BoxedTransport, TlsUpgrader};
use crate::writer::{spawn_writer_task, WriterConfig};

/// Builder for an [`Endpoint`].
pub struct EndpointBuilder {
    config: EndpointConfig,
    services: ServiceRegistry,
    mechanisms: MechanismRegistry,
    tls: Option<Arc<dyn TlsUpgrader>>,
}

impl EndpointBuilder {
    /// Start a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: EndpointConfig::default(),
            services: ServiceRegistry::new(),
            mechanisms: MechanismRegistry::new(),
            tls: None,
        }
    }

    /// Replace the endpoint configuration.
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an authentication mechanism provider.
    pub fn mechanism(mut self, provider: Arc<dyn MechanismProvider>) -> Self {
        self.mechanisms.register(provider);
        self
    }

    /// Register a service open listener.
    pub fn service(self, name: impl Into<String>, listener: Arc<dyn OpenListener>) -> Self {
        self.services.register(name, listener);
        self
    }

    /// Register an invocation handler as a service.
    pub fn invocation_service(
        self,
        name: impl Into<String>,
        handler: Arc<dyn InvocationHandler>,
    ) -> Self {
        self.services.register_invocations(name, handler);
        self
    }

    /// Install the transport-security upgrade hook.
    pub fn tls_upgrader(mut self, upgrader: Arc<dyn TlsUpgrader>) -> Self {
        self.tls = Some(upgrader);
        self
    }

    /// Build the endpoint.
    pub fn build(self) -> Endpoint {
        Endpoint {
            inner: Arc::new(EndpointInner {
                config: Arc::new(self.config),
                services: self.services,
                mechanisms: self.mechanisms,
                tls: self.tls,
                tracker: ResourceTracker::new(),
                connections: Mutex::new(HashMap::new()),
                next_conn_seq: AtomicU64::new(1),
            }),
        }
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct EndpointInner {
    config: Arc<EndpointConfig>,
    services: ServiceRegistry,
    mechanisms: MechanismRegistry,
    tls: Option<Arc<dyn TlsUpgrader>>,
    tracker: ResourceTracker,
    connections: Mutex<HashMap<u64, Connection>>,
    next_conn_seq: AtomicU64,
}

/// A remlink endpoint, usable as initiator and acceptor symmetrically.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Start building an endpoint.
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    /// The endpoint's service registry; services may be registered or
    /// removed while connections are live.
    pub fn services(&self) -> ServiceRegistry {
        self.inner.services.clone()
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.inner.tracker.is_closing()
    }

    /// Connect over an established transport (initiator role).
    pub async fn connect(&self, transport: BoxedTransport) -> Result<Connection> {
        self.establish(transport, Role::Initiator).await
    }

    /// Connect over TCP (initiator role).
    pub async fn connect_tcp(&self, addr: impl ToSocketAddrs) -> Result<Connection> {
        let transport = transport::connect_tcp(addr).await?;
        self.connect(transport).await
    }

    /// Accept a connection over an established transport (acceptor role).
    pub async fn accept(&self, transport: BoxedTransport) -> Result<Connection> {
        self.establish(transport, Role::Acceptor).await
    }

    async fn establish(&self, transport: BoxedTransport, role: Role) -> Result<Connection> {
        let guard = self.inner.tracker.register()?;
        let outcome = drive_negotiation(
            transport,
            role,
            self.inner.config.clone(),
            self.inner.mechanisms.clone(),
            self.inner.tls.clone(),
        )
        .await?;

        let (reader, write_half) = tokio::io::split(outcome.transport);
        let (writer, _writer_task) = spawn_writer_task(write_half, WriterConfig::default());

        let seq = self.inner.next_conn_seq.fetch_add(1, Ordering::AcqRel);
        let endpoint = Arc::downgrade(&self.inner);
        let connection = start_connection(
            role,
            outcome.session,
            self.inner.config.clone(),
            self.inner.services.clone(),
            writer,
            reader,
            outcome.buffer,
            outcome.leftover,
            guard,
            Box::new(move || {
                if let Some(endpoint) = endpoint.upgrade() {
                    endpoint
                        .connections
                        .lock()
                        .expect("connections lock")
                        .remove(&seq);
                }
            }),
        );
        self.inner
            .connections
            .lock()
            .expect("connections lock")
            .insert(seq, connection.clone());
        Ok(connection)
    }

    /// Number of live connections owned by this endpoint.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().expect("connections lock").len()
    }

    /// Two-phase shutdown.
    ///
    /// Phase 1 closes every live connection and waits for all lifecycle
    /// registrations to drain; phase 2 (exactly once, on the initiating
    /// caller) tears down the endpoint's own state. New connections fail
    /// with [`Error::Closed`] as soon as this is called.
    pub async fn close(&self) {
        let connections: Vec<Connection> = {
            let map = self.inner.connections.lock().expect("connections lock");
            map.values().cloned().collect()
        };
        for connection in connections {
            connection.close().await;
        }
        let initiator = self.inner.tracker.close_and_drain().await;
        if initiator {
            self.inner
                .connections
                .lock()
                .expect("connections lock")
                .clear();
            for name in self.inner.services.names() {
                self.inner.services.unregister(&name);
            }
            tracing::debug!("endpoint closed");
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.config.name)
            .field("closing", &self.inner.tracker.is_closing())
            .field("connections", &self.connection_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Negotiation driver
// ---------------------------------------------------------------------------

struct NegotiationOutcome {
    transport: BoxedTransport,
    session: NegotiatedSession,
    buffer: FrameBuffer,
    /// Frames decoded after authentication completed, to be dispatched by
    /// the connection's read loop.
    leftover: Vec<Frame>,
}

enum RoleNegotiator {
    Initiator(InitiatorNegotiator),
    Acceptor(AcceptorNegotiator),
}

impl RoleNegotiator {
    fn on_frame(&mut self, frame: Frame) -> Result<Vec<NegotiateAction>> {
        match self {
            RoleNegotiator::Initiator(n) => n.on_frame(frame),
            RoleNegotiator::Acceptor(n) => n.on_frame(frame),
        }
    }
}

async fn send_frame(transport: &mut BoxedTransport, frame: &Frame) -> Result<()> {
    transport.write_all(&frame.encode()).await?;
    transport.flush().await?;
    Ok(())
}

/// Run the negotiation state machine over the transport.
async fn drive_negotiation(
    mut transport: BoxedTransport,
    role: Role,
    config: Arc<EndpointConfig>,
    mechanisms: MechanismRegistry,
    tls: Option<Arc<dyn TlsUpgrader>>,
) -> Result<NegotiationOutcome> {
    let has_upgrader = tls.is_some();
    let mut negotiator = match role {
        Role::Initiator => RoleNegotiator::Initiator(InitiatorNegotiator::new(
            config,
            mechanisms,
            has_upgrader,
        )),
        Role::Acceptor => {
            let acceptor = AcceptorNegotiator::new(config, mechanisms, has_upgrader);
            send_frame(&mut transport, &acceptor.greeting()).await?;
            RoleNegotiator::Acceptor(acceptor)
        }
    };

    let mut buffer = FrameBuffer::new();
    let mut read_buf = vec![0u8; 16 * 1024];

    loop {
        let n = transport.read(&mut read_buf).await?;
        if n == 0 {
            return Err(Error::Indeterminate(
                "peer disconnected during negotiation".into(),
            ));
        }
        let mut frames = buffer.push(&read_buf[..n])?.into_iter();
        while let Some(frame) = frames.next() {
            let actions = negotiator.on_frame(frame)?;
            for action in actions {
                match action {
                    NegotiateAction::Send(frame) => send_frame(&mut transport, &frame).await?,
                    NegotiateAction::UpgradeTls => {
                        if buffer.pending_bytes() != 0 || frames.len() != 0 {
                            return Err(Error::Protocol(
                                "unexpected data before security upgrade".into(),
                            ));
                        }
                        let upgrader = tls.as_ref().ok_or_else(|| {
                            Error::Protocol("security upgrade without an upgrader".into())
                        })?;
                        transport = match role {
                            Role::Initiator => upgrader.upgrade_initiator(transport).await?,
                            Role::Acceptor => upgrader.upgrade_acceptor(transport).await?,
                        };
                    }
                    NegotiateAction::Complete(session) => {
                        tracing::debug!(
                            principal = %session.principal,
                            mechanism = %session.mechanism,
                            role = ?role,
                            "negotiation complete"
                        );
                        return Ok(NegotiationOutcome {
                            transport,
                            session,
                            buffer,
                            leftover: frames.collect(),
                        });
                    }
                    NegotiateAction::PeerClosed => {
                        return Err(Error::Closed);
                    }
                    NegotiateAction::Fail(reason) => {
                        return Err(Error::Authentication(reason));
                    }
                }
            }
        }
    }
}

//! # remlink
//!
//! Connection-oriented remote-invocation transport: authenticated,
//! encrypted-capable links between two peers, many independent logical
//! channels multiplexed over one physical connection with credit-based
//! flow control, and request/reply correlation with cancellation on top.
//!
//! Both roles are symmetric: an [`Endpoint`] can connect and accept, and
//! either side of an authenticated [`Connection`] may open channels,
//! stream messages, and serve or issue invocations.
//!
//! ## Architecture
//!
//! - **Control Plane** (negotiation): greeting, capabilities, optional
//!   STARTTLS upgrade, SASL-style mechanism authentication
//! - **Data Plane** (post-auth): channels, flow-controlled message
//!   streams, and the invocation correlator
//!
//! ## Example
//!
//! ```ignore
//! use remlink::{auth::AnonymousMechanism, rpc, transport, ChannelOptions, Endpoint};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Endpoint::builder()
//!         .mechanism(Arc::new(AnonymousMechanism::new()))
//!         .invocation_service("echo", rpc::handler_fn(|payload, ctx| async move {
//!             ctx.reply(payload).await
//!         }))
//!         .build();
//!     let client = Endpoint::builder()
//!         .mechanism(Arc::new(AnonymousMechanism::new()))
//!         .build();
//!
//!     let (a, b) = transport::memory_pair(64 * 1024);
//!     let (accepted, connection) =
//!         tokio::try_join!(server.accept(a), client.connect(b))?;
//!
//!     let channel = connection.open_channel("echo", ChannelOptions::default()).await?;
//!     let invoker = rpc::InvocationClient::new(channel);
//!     let reply = invoker.invoke("hello".into()).await?;
//!     assert_eq!(&reply[..], b"hello");
//!     # let _ = accepted;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod service;
pub mod transport;

mod channel;
mod connection;
mod endpoint;
mod flow;
mod lifecycle;
mod message;
mod negotiate;
mod writer;

pub use channel::Channel;
pub use config::{ChannelOptions, EndpointConfig};
pub use connection::{Connection, Role};
pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{Error, Result};
pub use message::{InboundMessage, MessageWriter};
pub use negotiate::{NegotiatedSession, SecurityLayer};
pub use service::{OpenListener, ServiceRegistry};
pub use transport::{BoxedTransport, TlsUpgrader, Transport};

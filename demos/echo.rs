//! Echo demo: an acceptor and an initiator over TCP in one process.
//!
//! Run with: `cargo run --example echo`

use std::sync::Arc;

use bytes::Bytes;
use remlink::auth::HmacSha256Mechanism;
use remlink::rpc::{handler_fn, InvocationClient, RequestContext};
use remlink::{transport, ChannelOptions, Endpoint, EndpointConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remlink=debug".into()),
        )
        .init();

    let server = Endpoint::builder()
        .config(EndpointConfig::new().name("echo-server"))
        .mechanism(Arc::new(HmacSha256Mechanism::new("demo", "shared-secret")))
        .invocation_service(
            "echo",
            handler_fn(|payload, ctx: RequestContext| async move { ctx.reply(payload).await }),
        )
        .build();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server_clone = server.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            tracing::info!(%peer, "accepting connection");
            let server = server_clone.clone();
            tokio::spawn(async move {
                match transport::from_tcp(stream) {
                    Ok(transport) => {
                        if let Err(e) = server.accept(transport).await {
                            tracing::warn!(error = %e, "handshake failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "transport setup failed"),
                }
            });
        }
    });

    let client = Endpoint::builder()
        .mechanism(Arc::new(HmacSha256Mechanism::new("demo", "shared-secret")))
        .build();
    let connection = client.connect_tcp(addr).await?;
    tracing::info!(
        principal = connection.principal(),
        server = ?connection.peer_name(),
        "connected"
    );

    let channel = connection
        .open_channel("echo", ChannelOptions::default())
        .await?;
    let invoker = InvocationClient::new(channel);

    for text in ["hello", "remlink", "goodbye"] {
        let reply = invoker.invoke(Bytes::from(text.as_bytes().to_vec())).await?;
        println!("{text} -> {}", String::from_utf8_lossy(&reply));
    }

    client.close().await;
    server.close().await;
    Ok(())
}

//! Streaming demo: a multi-fragment message under a small window, with
//! the consumer abandoning the stream partway through.
//!
//! Run with: `cargo run --example stream`

use std::sync::Arc;

use remlink::auth::AnonymousMechanism;
use remlink::{transport, Channel, ChannelOptions, Endpoint};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remlink=debug".into()),
        )
        .init();

    let server = Endpoint::builder()
        .mechanism(Arc::new(AnonymousMechanism::new()))
        .build();
    server.services().register(
        "firehose",
        Arc::new(|channel: Channel| {
            tokio::spawn(async move {
                let mut message = channel.next_message().await?;
                let mut read = 0usize;
                while let Some(chunk) = message.read_chunk().await? {
                    read += chunk.len();
                    if read >= 8 * 1024 {
                        println!("consumer: read {read} bytes, abandoning the rest");
                        message.cancel();
                        break;
                    }
                }
                Ok::<_, remlink::Error>(())
            });
        }),
    );

    let client = Endpoint::builder()
        .mechanism(Arc::new(AnonymousMechanism::new()))
        .build();

    let (a, b) = transport::memory_pair(64 * 1024);
    let (_accepted, connection) = tokio::try_join!(server.accept(a), client.connect(b))?;

    let channel = connection
        .open_channel("firehose", ChannelOptions::default().outbound_window(4096))
        .await?;

    let mut writer = channel.send_message().await?;
    let block = vec![0x5Au8; 1024];
    let mut sent = 0usize;
    for _ in 0..64 {
        match writer.write(&block).await {
            Ok(()) => sent += block.len(),
            Err(remlink::Error::MessageCancelled) => {
                println!("producer: consumer walked away after {sent} bytes");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    client.close().await;
    server.close().await;
    Ok(())
}

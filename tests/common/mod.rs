#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use whatsapp_engine::crypto::KeyPair;
use whatsapp_engine::socket::{accept, CertIssuer, ChunkSink, ChunkStream, Connection, Connector, Transport};
use whatsapp_engine::types::EventHandlers;
use whatsapp_engine::EngineConfig;

/// How the relay between client and server mangles server-to-client chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relay {
    /// Flip the last bit of the server chunk with this index.
    pub tamper_server_chunk: Option<usize>,
    /// Forward every chunk one byte at a time.
    pub split: bool,
}

async fn pump(mut from: ChunkStream, mut to: ChunkSink, tamper_at: Option<usize>, split: bool) {
    let mut index = 0;
    while let Some(Ok(mut chunk)) = from.next().await {
        if tamper_at == Some(index) {
            if let Some(last) = chunk.last_mut() {
                *last ^= 1;
            }
        }
        index += 1;
        if split {
            for byte in chunk {
                if to.send(vec![byte]).await.is_err() {
                    return;
                }
            }
        } else if to.send(chunk).await.is_err() {
            return;
        }
    }
    let _ = to.close().await;
}

/// Handshake a client and an in-process server over a relay.
pub async fn connect_pair(
    relay: Relay,
    client_handlers: EventHandlers,
    server_handlers: EventHandlers,
) -> (Connection, Connection) {
    let issuer = CertIssuer::generate();
    let server_static = KeyPair::generate();
    let chain = issuer.issue(&server_static.public);
    let config = EngineConfig::default().with_cert_root_key(&issuer.root_public());

    let (client_side, relay_client) = Transport::memory_pair(64);
    let (relay_server, server_side) = Transport::memory_pair(64);
    tokio::spawn(pump(relay_client.stream, relay_server.sink, None, relay.split));
    tokio::spawn(pump(relay_server.stream, relay_client.sink, relay.tamper_server_chunk, relay.split));

    let server_config = config.clone();
    let server = tokio::spawn(async move {
        accept(
            server_side,
            whatsapp_engine::socket::ServerHandshake::new(server_static, chain),
            &server_config,
            server_handlers,
        )
        .await
    });
    let connector = Connector::new(config, KeyPair::generate(), client_handlers);
    let client = connector.connect(client_side, b"integration").await.unwrap();
    let (server, accepted) = server.await.unwrap().unwrap();
    assert_eq!(accepted.payload, b"integration");
    (client, server)
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;
use tokio::sync::mpsc;
use whatsapp_engine::appstate::{
    build_snapshot, build_sync_response, AppStateSync, Collection, CollectionState, MemoryPatchSource, MemorySink,
    NodePatchSource, PatchBuilder, PatchSource, APP_STATE_XMLNS,
};
use whatsapp_engine::crypto::KeyPair;
use whatsapp_engine::proto::{MuteAction, PinAction, SyncActionValue};
use whatsapp_engine::protocol::build_iq;
use whatsapp_engine::socket::{accept, CertIssuer, Connector, ServerHandshake, Transport};
use whatsapp_engine::store::{AppStateKeyStore, AppStateSyncKey, MemoryStore};
use whatsapp_engine::types::{EventHandlers, SERVER_JID};
use whatsapp_engine::{marshal, unmarshal, EngineConfig, Node};

/// Inspect and exercise the protocol engine without a live account.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to a JSON engine configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode a hex frame payload and print the node tree.
    Decode { hex: String },
    /// Print the hex payload of a sample node.
    EncodeDemo,
    /// Handshake, query, and app-state sync against an in-process server.
    Loopback,
    /// Print the effective configuration.
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Decode { hex } => {
            let payload = hex::decode(hex.trim())?;
            println!("{}", unmarshal(&payload)?);
        }
        Commands::EncodeDemo => {
            let node = sample_node();
            println!("{node}");
            println!("{}", hex::encode(marshal(&node)?));
        }
        Commands::Loopback => loopback(config).await?,
        Commands::ShowConfig => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}

fn sample_node() -> Node {
    build_iq(
        "set",
        APP_STATE_XMLNS,
        SERVER_JID.clone(),
        vec![Node::new("sync").children(vec![Node::new("collection")
            .attr("name", Collection::Regular.name())
            .attr("version", 0i64)
            .attr("return_snapshot", "true")])],
    )
    .attr("id", "1a2b.1")
}

/// History the loopback server hands out for the `regular` collection.
fn demo_history(key_id: &[u8], key_data: &[u8]) -> Result<MemoryPatchSource, Box<dyn std::error::Error>> {
    let pinned = SyncActionValue {
        pin_action: Some(PinAction { pinned: Some(true) }),
        ..Default::default()
    };
    let (snapshot, mut state): (_, CollectionState) = build_snapshot(
        Collection::Regular,
        key_id,
        key_data,
        1,
        &[(&["pin_v1", "15550001@s.whatsapp.net"], pinned)],
    )?;
    let muted = SyncActionValue {
        timestamp: Some(chrono::Utc::now().timestamp()),
        mute_action: Some(MuteAction {
            muted: Some(true),
            mute_end_timestamp: None,
        }),
        ..Default::default()
    };
    let source = MemoryPatchSource::new(1);
    source.set_snapshot(snapshot);
    source.push_patch(
        PatchBuilder::new(Collection::Regular, key_id, key_data)
            .set(&["mute", "15550002@s.whatsapp.net"], muted)
            .build(&mut state)?,
    );
    source.push_patch(
        PatchBuilder::new(Collection::Regular, key_id, key_data)
            .remove(&["pin_v1", "15550001@s.whatsapp.net"])
            .build(&mut state)?,
    );
    Ok(source)
}

async fn loopback(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let issuer = CertIssuer::generate();
    let server_static = KeyPair::generate();
    let chain = issuer.issue(&server_static.public);
    let config = config.with_cert_root_key(&issuer.root_public());
    let (client_side, server_side) = Transport::memory_pair(16);

    let key_id = b"loopback-key".to_vec();
    let key_data: [u8; 32] = rand::random();
    let history = Arc::new(demo_history(&key_id, &key_data)?);

    let (tx, mut rx) = mpsc::unbounded_channel::<Node>();
    let server_handlers = EventHandlers::new().on_node(move |node| {
        let _ = tx.send(node.clone());
    });
    let server_config = config.clone();
    let server = tokio::spawn(async move {
        let (conn, accepted) = accept(
            server_side,
            ServerHandshake::new(server_static, chain),
            &server_config,
            server_handlers,
        )
        .await?;
        info!("Server accepted client with {}-byte payload", accepted.payload.len());
        while let Some(request) = rx.recv().await {
            let id = request.get_attr_str("id").unwrap_or_default().to_string();
            let Some(collection) = request
                .get_child_by_tag("sync")
                .and_then(|s| s.get_child_by_tag("collection"))
            else {
                continue;
            };
            let name: Collection = collection.get_attr_str("name").unwrap_or_default().parse()?;
            let since = collection.get_attr_i64("version").unwrap_or_default() as u64;
            let want_snapshot = collection.get_attr_str("return_snapshot") == Some("true");
            let page = history.fetch(name, since, want_snapshot).await?;
            conn.send_node(&build_sync_response(name, &id, &page)).await?;
        }
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
    });

    let connector = Connector::new(config.clone(), KeyPair::generate(), EventHandlers::new());
    let connection = connector.connect(client_side, b"loopback").await?;
    println!("handshake complete");

    let store = Arc::new(MemoryStore::generate());
    store.put_app_state_key(
        &key_id,
        AppStateSyncKey {
            key_data: key_data.to_vec(),
            timestamp: chrono::Utc::now().timestamp(),
        },
    )?;
    let sink = Arc::new(MemorySink::new());
    let handlers = EventHandlers::new().on_sync_conflict(|c| println!("conflict in {}: {}", c.collection, c.reason));
    let engine = AppStateSync::new(
        store,
        Arc::new(NodePatchSource::new(connection.clone())),
        sink.clone(),
        handlers,
    );
    let summary = engine.sync(Collection::Regular).await?;
    println!(
        "synced {} to version {} ({} patches, {} mutations)",
        summary.collection, summary.version, summary.patches_applied, summary.mutations_applied
    );
    if let Some(mutation) = sink.get(Collection::Regular, &["mute", "15550002@s.whatsapp.net"]) {
        println!("materialized: {:?}", mutation.event);
    }
    println!("live entries: {}", sink.len(Collection::Regular));

    connection.close();
    server.abort();
    Ok(())
}

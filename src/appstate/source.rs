//! Where patches come from: the server over a connection, or memory in tests.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use log::debug;
use prost::Message;

use crate::binary::Node;
use crate::proto::{SyncdPatch, SyncdSnapshot};
use crate::protocol::build_iq;
use crate::socket::Connection;
use crate::types::SERVER_JID;

use super::patch::version_of;
use super::{Collection, SyncError};

pub const APP_STATE_XMLNS: &str = "w:sync:app:state";

/// One page of a collection's history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchList {
    pub snapshot: Option<SyncdSnapshot>,
    /// Patches in ascending version order.
    pub patches: Vec<SyncdPatch>,
    pub has_more: bool,
}

#[async_trait]
pub trait PatchSource: Send + Sync {
    /// Patches after `since_version`; with `want_snapshot`, a snapshot first.
    async fn fetch(&self, collection: Collection, since_version: u64, want_snapshot: bool)
        -> Result<PatchList, SyncError>;
}

/// Fetches patches with `w:sync:app:state` queries.
#[derive(Clone)]
pub struct NodePatchSource {
    connection: Connection,
}

impl NodePatchSource {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

/// The `iq` asking for a collection's patches after `since_version`.
pub fn build_sync_request(collection: Collection, since_version: u64, want_snapshot: bool) -> Node {
    let collection_node = Node::new("collection")
        .attr("name", collection.name())
        .attr("version", since_version)
        .attr("return_snapshot", want_snapshot.to_string());
    build_iq(
        "set",
        APP_STATE_XMLNS,
        SERVER_JID.clone(),
        vec![Node::new("sync").children(vec![collection_node])],
    )
}

/// Parse the response to [`build_sync_request`].
pub fn parse_sync_response(node: &Node, collection: Collection) -> Result<PatchList, SyncError> {
    let collection_node = node
        .get_child_by_tag("sync")
        .and_then(|sync| {
            sync.get_children_by_tag("collection")
                .find(|c| c.get_attr_str("name") == Some(collection.name()))
        })
        .ok_or_else(|| SyncError::InvalidPatch(format!("response lacks collection {collection}")))?;
    if collection_node.get_attr_str("type") == Some("error") {
        return Err(SyncError::InvalidPatch(format!("server refused collection {collection}")));
    }

    let snapshot = collection_node
        .get_child_by_tag("snapshot")
        .and_then(Node::get_bytes)
        .map(SyncdSnapshot::decode)
        .transpose()
        .map_err(|e| SyncError::InvalidPatch(format!("snapshot: {e}")))?;
    let mut patches = collection_node
        .get_child_by_tag("patches")
        .map(|p| p.get_children_by_tag("patch").collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .filter_map(Node::get_bytes)
        .map(SyncdPatch::decode)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::InvalidPatch(format!("patch: {e}")))?;
    patches.sort_by_key(|p| p.version.as_ref().and_then(|v| v.version).unwrap_or_default());

    Ok(PatchList {
        snapshot,
        patches,
        has_more: collection_node.get_attr_str("has_more_patches") == Some("true"),
    })
}

/// Encode a page as the server would answer it; used by test servers.
pub fn build_sync_response(collection: Collection, id: &str, list: &PatchList) -> Node {
    let mut children = Vec::new();
    if let Some(snapshot) = &list.snapshot {
        children.push(Node::new("snapshot").bytes(snapshot.encode_to_vec()));
    }
    children.push(
        Node::new("patches").children(
            list.patches
                .iter()
                .map(|p| Node::new("patch").bytes(p.encode_to_vec()))
                .collect(),
        ),
    );
    let collection_node = Node::new("collection")
        .attr("name", collection.name())
        .attr("has_more_patches", list.has_more.to_string())
        .children(children);
    Node::new("iq")
        .attr("id", id)
        .attr("type", "result")
        .children(vec![Node::new("sync").children(vec![collection_node])])
}

#[async_trait]
impl PatchSource for NodePatchSource {
    async fn fetch(
        &self,
        collection: Collection,
        since_version: u64,
        want_snapshot: bool,
    ) -> Result<PatchList, SyncError> {
        debug!("Fetching {collection} patches after version {since_version} (snapshot: {want_snapshot})");
        let response = self
            .connection
            .send_request(build_sync_request(collection, since_version, want_snapshot))
            .await?;
        parse_sync_response(&response, collection)
    }
}

/// Serves a fixed history from memory, `page_size` patches per fetch.
#[derive(Debug)]
pub struct MemoryPatchSource {
    inner: Mutex<MemoryHistory>,
    page_size: usize,
}

#[derive(Debug, Default)]
struct MemoryHistory {
    snapshot: Option<SyncdSnapshot>,
    patches: Vec<SyncdPatch>,
    fetches: Vec<(u64, bool)>,
}

impl MemoryPatchSource {
    pub fn new(page_size: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryHistory::default()),
            page_size: page_size.max(1),
        }
    }

    fn history(&self) -> std::sync::MutexGuard<'_, MemoryHistory> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_snapshot(&self, snapshot: SyncdSnapshot) {
        self.history().snapshot = Some(snapshot);
    }

    pub fn push_patch(&self, patch: SyncdPatch) {
        self.history().patches.push(patch);
    }

    /// `(since_version, want_snapshot)` of every fetch so far.
    pub fn fetches(&self) -> Vec<(u64, bool)> {
        self.history().fetches.clone()
    }
}

#[async_trait]
impl PatchSource for MemoryPatchSource {
    async fn fetch(
        &self,
        _collection: Collection,
        since_version: u64,
        want_snapshot: bool,
    ) -> Result<PatchList, SyncError> {
        let mut history = self.history();
        history.fetches.push((since_version, want_snapshot));
        let snapshot = if want_snapshot { history.snapshot.clone() } else { None };
        let from = match &snapshot {
            Some(s) => version_of(s.version.as_ref())?,
            None => since_version,
        };
        let mut pending = Vec::new();
        for patch in &history.patches {
            if version_of(patch.version.as_ref())? > from {
                pending.push(patch.clone());
            }
        }
        let has_more = pending.len() > self.page_size;
        pending.truncate(self.page_size);
        Ok(PatchList {
            snapshot,
            patches: pending,
            has_more,
        })
    }
}

//! Request/response handling for IQ queries.
//!
//! Outbound requests are registered under a generated id; the read loop
//! resolves them when an `iq` of type `result` or `error` with that id
//! arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::binary::Node;
use crate::socket::TransportError;
use crate::types::Jid;

/// Why a request did not produce a result node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error("server returned error {code}: {text}")]
    Server { code: i64, text: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

type Reply = Result<Node, RequestError>;

/// Request tracker for IQ messages.
pub struct RequestTracker {
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    prefix: u16,
    counter: AtomicU64,
}

impl RequestTracker {
    /// Create a new request tracker.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            prefix: rand::random(),
            counter: AtomicU64::new(0),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate a new unique request ID.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{:04X}.{}", self.prefix, n)
    }

    /// Register a pending request. The entry lives as long as the returned
    /// handle; dropping it, even mid-wait, removes the entry.
    pub fn register(&self, id: &str) -> PendingRequest<'_> {
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.to_string(), tx);
        PendingRequest {
            tracker: self,
            id: id.to_string(),
            rx,
        }
    }

    /// Resolve the request `node` answers. Returns false when the node is not
    /// an iq response or nobody is waiting for it.
    pub fn resolve(&self, node: &Node) -> bool {
        if !is_iq_result(node) && !is_iq_error(node) {
            return false;
        }
        let Some(id) = node.get_attr_str("id") else {
            return false;
        };
        let Some(tx) = self.pending().remove(id) else {
            return false;
        };
        let reply = match parse_iq_error(node) {
            Some((code, text)) => Err(RequestError::Server { code, text }),
            None => Ok(node.clone()),
        };
        // The waiter may have given up already; the entry is gone either way.
        let _ = tx.send(reply);
        true
    }

    /// Cancel a pending request.
    pub fn cancel(&self, id: &str) {
        self.pending().remove(id);
    }

    /// Fail every waiter; used when the connection goes away.
    pub fn fail_all(&self) {
        let drained: Vec<_> = self.pending().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(RequestError::ConnectionClosed));
        }
    }

    /// Get count of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

/// A request waiting for its reply.
pub struct PendingRequest<'a> {
    tracker: &'a RequestTracker,
    id: String,
    rx: oneshot::Receiver<Reply>,
}

impl PendingRequest<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait up to `timeout` for the reply.
    pub async fn wait(mut self, timeout: Duration) -> Reply {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RequestError::ConnectionClosed),
            Err(_) => Err(RequestError::Timeout),
        }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.tracker.cancel(&self.id);
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an iq request; the id is assigned when it is sent.
pub fn build_iq(iq_type: &str, xmlns: &str, to: Jid, children: Vec<Node>) -> Node {
    let node = Node::new("iq").attr("type", iq_type).attr("xmlns", xmlns).attr("to", to);
    if children.is_empty() {
        node
    } else {
        node.children(children)
    }
}

/// Build an IQ result response.
pub fn build_iq_result(id: &str, to: Option<Jid>) -> Node {
    let node = Node::new("iq").attr("id", id).attr("type", "result");
    match to {
        Some(to) => node.attr("to", to),
        None => node,
    }
}

/// Check if a node is an IQ result.
pub fn is_iq_result(node: &Node) -> bool {
    node.tag == "iq" && node.get_attr_str("type") == Some("result")
}

/// Check if a node is an IQ error.
pub fn is_iq_error(node: &Node) -> bool {
    node.tag == "iq" && node.get_attr_str("type") == Some("error")
}

/// `(code, text)` of an IQ error node.
pub fn parse_iq_error(node: &Node) -> Option<(i64, String)> {
    if !is_iq_error(node) {
        return None;
    }
    let error = node.get_child_by_tag("error");
    let code = error.and_then(|e| e.get_attr_i64("code")).unwrap_or(0);
    let text = error
        .and_then(|e| e.get_attr_str("text"))
        .unwrap_or("unknown error")
        .to_string();
    Some((code, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SERVER_JID;

    #[tokio::test]
    async fn test_request_tracker_resolves_result() {
        let tracker = RequestTracker::new();
        let id = tracker.next_id();
        let pending = tracker.register(&id);
        assert_eq!(tracker.pending_count(), 1);

        assert!(tracker.resolve(&build_iq_result(&id, None)));
        let reply = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.get_attr_str("id"), Some(id.as_str()));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_iq_error_becomes_server_error() {
        let tracker = RequestTracker::new();
        let id = tracker.next_id();
        let pending = tracker.register(&id);
        let error = Node::new("iq")
            .attr("id", id.as_str())
            .attr("type", "error")
            .children(vec![Node::new("error").attr("code", 404i64).attr("text", "item-not-found")]);

        assert!(tracker.resolve(&error));
        assert_eq!(
            pending.wait(Duration::from_secs(1)).await,
            Err(RequestError::Server {
                code: 404,
                text: "item-not-found".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let tracker = RequestTracker::new();
        let id = tracker.next_id();
        let pending = tracker.register(&id);
        assert_eq!(
            pending.wait(Duration::from_secs(20)).await,
            Err(RequestError::Timeout)
        );
        assert_eq!(tracker.pending_count(), 0);
        assert!(!tracker.resolve(&build_iq_result(&id, None)));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let tracker = RequestTracker::new();
        let a = tracker.next_id();
        let b = tracker.next_id();
        assert_ne!(a, b);
        let pending_a = tracker.register(&a);
        let pending_b = tracker.register(&b);
        tracker.fail_all();
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(pending_a.wait(Duration::from_secs(1)).await, Err(RequestError::ConnectionClosed));
        assert_eq!(pending_b.wait(Duration::from_secs(1)).await, Err(RequestError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_removes_entry() {
        let tracker = RequestTracker::new();
        for _ in 0..5 {
            let id = tracker.next_id();
            let pending = tracker.register(&id);
            let outer = tokio::time::timeout(Duration::from_millis(20), pending.wait(Duration::from_secs(20))).await;
            assert!(outer.is_err());
        }
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_non_iq_is_not_consumed() {
        let tracker = RequestTracker::new();
        let pending = tracker.register("1");
        assert!(!tracker.resolve(&Node::new("message").attr("id", "1")));
        assert_eq!(tracker.pending_count(), 1);
        drop(pending);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_build_iq() {
        let node = build_iq("get", "w:profile:picture", SERVER_JID.clone(), vec![]);
        assert_eq!(node.tag, "iq");
        assert_eq!(node.get_attr_str("type"), Some("get"));
        assert_eq!(node.get_attr_str("xmlns"), Some("w:profile:picture"));
        assert_eq!(node.get_attr_jid("to"), Some(SERVER_JID.clone()));
    }
}

//! Connection registry: authentication, group membership and fan-out.
//!
//! Every admitted connection owns a bounded outbound queue. Pushes are
//! serialised once and handed to each target queue with `try_send`, so a
//! slow reader only loses its own pushes and never stalls the caller.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use watchsec_core::types::ConnectionRole;

use crate::error::PersistError;
use crate::ports::{SessionVerifier, TenantDirectory};
use crate::protocol::HubPush;

pub type ConnectionId = u64;

/// Inputs read from the HTTP upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub agent_id: Option<String>,
    pub tenant_key: Option<String>,
    pub bearer: Option<String>,
}

impl HandshakeRequest {
    pub fn from_http<B>(req: &http::Request<B>) -> Self {
        let agent_id = req
            .uri()
            .query()
            .and_then(|q| query_param(q, "agentId"))
            .filter(|v| !v.is_empty());

        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let bearer = header("authorization").and_then(|v| {
            v.strip_prefix("Bearer ")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        });

        Self {
            agent_id,
            tenant_key: header("x-tenant-key"),
            bearer,
        }
    }

    /// Agent identifier for log lines.
    pub fn agent_label(&self) -> &str {
        self.agent_id.as_deref().unwrap_or("Unknown")
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub role: ConnectionRole,
    pub group: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("no dashboard session and no tenant key")]
    MissingCredentials,
    #[error("unknown tenant key")]
    UnknownTenant,
    #[error("credential lookup failed: {0}")]
    Lookup(#[from] PersistError),
}

/// Registry counts reported by the admin API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySnapshot {
    pub dashboards: usize,
    pub agents: usize,
    pub groups: BTreeMap<String, usize>,
}

struct ConnectionEntry {
    role: ConnectionRole,
    group: Option<String>,
    tx: mpsc::Sender<Arc<str>>,
}

pub struct ConnectionGateway {
    tenants: Arc<dyn TenantDirectory>,
    sessions: Arc<dyn SessionVerifier>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    groups: DashMap<String, HashSet<ConnectionId>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl ConnectionGateway {
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        sessions: Arc<dyn SessionVerifier>,
        queue_depth: usize,
    ) -> Self {
        Self {
            tenants,
            sessions,
            connections: DashMap::new(),
            groups: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Decide whether a connection may join.
    ///
    /// A valid dashboard session wins; otherwise the tenant key must resolve.
    /// Agents join the group named by their agent id when one was supplied.
    pub async fn authenticate(&self, req: &HandshakeRequest) -> Result<Admission, Rejection> {
        if let Some(token) = &req.bearer {
            if let Some(session) = self.sessions.verify_session(token).await? {
                return Ok(Admission {
                    role: ConnectionRole::Dashboard {
                        username: session.username,
                    },
                    group: None,
                });
            }
        }

        let Some(key) = &req.tenant_key else {
            return Err(Rejection::MissingCredentials);
        };
        let tenant = self
            .tenants
            .tenant_by_api_key(key)
            .await?
            .ok_or(Rejection::UnknownTenant)?;

        Ok(Admission {
            role: ConnectionRole::Agent {
                tenant_id: tenant.id,
            },
            group: req.agent_id.clone(),
        })
    }

    /// Add an admitted connection and return its id and push queue.
    pub fn register(&self, admission: &Admission) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.connections.insert(
            id,
            ConnectionEntry {
                role: admission.role.clone(),
                group: admission.group.clone(),
                tx,
            },
        );
        if let Some(group) = &admission.group {
            self.groups.entry(group.clone()).or_default().insert(id);
        }
        tracing::debug!(
            connection_id = id,
            role = admission.role.label(),
            group = ?admission.group,
            "gateway: connection registered"
        );
        (id, rx)
    }

    /// Remove a connection and its group membership. Idempotent.
    ///
    /// Returns the group name when this was its last member.
    pub fn unregister(&self, id: ConnectionId) -> Option<String> {
        let (_, entry) = self.connections.remove(&id)?;
        tracing::debug!(connection_id = id, "gateway: connection removed");
        let group = entry.group?;
        if let Some(mut members) = self.groups.get_mut(&group) {
            members.remove(&id);
        }
        self.groups
            .remove_if(&group, |_, members| members.is_empty())
            .map(|(group, _)| group)
    }

    /// Deliver to every live connection. Returns the number of queues that
    /// accepted the push.
    pub fn broadcast_to_all(&self, push: &HubPush) -> usize {
        let Some(frame) = render(push) else {
            return 0;
        };
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if enqueue(*entry.key(), &entry.value().tx, &frame, push) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver only to connections in `group`.
    pub fn send_to_group(&self, group: &str, push: &HubPush) -> usize {
        let members: Vec<ConnectionId> = match self.groups.get(group) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };
        let Some(frame) = render(push) else {
            return 0;
        };
        let mut delivered = 0;
        for id in members {
            if let Some(entry) = self.connections.get(&id) {
                if enqueue(id, &entry.tx, &frame, push) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn group_size(&self, group: &str) -> usize {
        self.groups.get(group).map(|m| m.len()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        let mut snap = GatewaySnapshot::default();
        for entry in self.connections.iter() {
            if entry.role.is_dashboard() {
                snap.dashboards += 1;
            } else {
                snap.agents += 1;
            }
        }
        for entry in self.groups.iter() {
            snap.groups.insert(entry.key().clone(), entry.value().len());
        }
        snap
    }
}

fn render(push: &HubPush) -> Option<Arc<str>> {
    match push.to_frame() {
        Ok(frame) => Some(Arc::from(frame)),
        Err(e) => {
            tracing::warn!(method = push.method(), error = %e, "gateway: failed to encode push");
            None
        }
    }
}

fn enqueue(id: ConnectionId, tx: &mpsc::Sender<Arc<str>>, frame: &Arc<str>, push: &HubPush) -> bool {
    match tx.try_send(Arc::clone(frame)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(
                connection_id = id,
                method = push.method(),
                "gateway: outbound queue full, dropping push"
            );
            false
        }
        // Handler already gone; it unregisters itself.
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::protocol::KillPush;

    fn gateway_with(backend: &Arc<MemoryBackend>, depth: usize) -> ConnectionGateway {
        ConnectionGateway::new(backend.clone(), backend.clone(), depth)
    }

    fn agent(group: Option<&str>) -> Admission {
        Admission {
            role: ConnectionRole::Agent { tenant_id: 1 },
            group: group.map(str::to_string),
        }
    }

    fn dashboard() -> Admission {
        Admission {
            role: ConnectionRole::Dashboard {
                username: "ops".into(),
            },
            group: None,
        }
    }

    fn kill(pid: u32) -> HubPush {
        HubPush::KillProcess(KillPush { pid })
    }

    #[test]
    fn handshake_reads_query_and_headers() {
        let req = http::Request::builder()
            .uri("/hub?foo=1&agentId=pc-17")
            .header("X-Tenant-Key", "k1")
            .header("Authorization", "Bearer tok")
            .body(())
            .unwrap();
        let hs = HandshakeRequest::from_http(&req);
        assert_eq!(hs.agent_id.as_deref(), Some("pc-17"));
        assert_eq!(hs.tenant_key.as_deref(), Some("k1"));
        assert_eq!(hs.bearer.as_deref(), Some("tok"));
    }

    #[test]
    fn handshake_agent_id_is_percent_decoded() {
        let req = http::Request::builder()
            .uri("/hub?agentId=pc%2D1")
            .body(())
            .unwrap();
        assert_eq!(HandshakeRequest::from_http(&req).agent_id.as_deref(), Some("pc-1"));

        let req = http::Request::builder()
            .uri("/hub?agentId=john%40corp&x=a+b")
            .body(())
            .unwrap();
        assert_eq!(
            HandshakeRequest::from_http(&req).agent_id.as_deref(),
            Some("john@corp")
        );
    }

    #[tokio::test]
    async fn encoded_agent_id_joins_its_plain_group() {
        let backend = Arc::new(MemoryBackend::default());
        backend.add_tenant("Acme", "key");
        let gw = gateway_with(&backend, 8);
        let req = http::Request::builder()
            .uri("/hub?agentId=pc%2D1")
            .header("X-Tenant-Key", "key")
            .body(())
            .unwrap();
        let admission = gw
            .authenticate(&HandshakeRequest::from_http(&req))
            .await
            .unwrap();
        let (_, mut rx) = gw.register(&admission);
        assert_eq!(gw.send_to_group("pc-1", &kill(7)), 1);
        assert!(rx.try_recv().unwrap().contains("\"pid\":7"));
    }

    #[test]
    fn handshake_without_inputs_labels_unknown() {
        let req = http::Request::builder().uri("/hub?agentId=").body(()).unwrap();
        let hs = HandshakeRequest::from_http(&req);
        assert_eq!(hs, HandshakeRequest::default());
        assert_eq!(hs.agent_label(), "Unknown");
    }

    #[tokio::test]
    async fn valid_tenant_key_admits_agent_into_group() {
        let backend = Arc::new(MemoryBackend::default());
        let tenant = backend.add_tenant("Acme", "key");
        let gw = gateway_with(&backend, 8);
        let admission = gw
            .authenticate(&HandshakeRequest {
                agent_id: Some("a1".into()),
                tenant_key: Some("key".into()),
                bearer: None,
            })
            .await
            .unwrap();
        assert_eq!(admission.role, ConnectionRole::Agent { tenant_id: tenant });
        assert_eq!(admission.group.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn agent_without_id_joins_no_group() {
        let backend = Arc::new(MemoryBackend::default());
        backend.add_tenant("Acme", "key");
        let gw = gateway_with(&backend, 8);
        let admission = gw
            .authenticate(&HandshakeRequest {
                tenant_key: Some("key".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(admission.group.is_none());
    }

    #[tokio::test]
    async fn dashboard_session_takes_precedence() {
        let backend = Arc::new(MemoryBackend::default());
        backend.add_session("tok", "alice");
        let gw = gateway_with(&backend, 8);
        let admission = gw
            .authenticate(&HandshakeRequest {
                agent_id: Some("a1".into()),
                tenant_key: Some("bogus".into()),
                bearer: Some("tok".into()),
            })
            .await
            .unwrap();
        assert!(admission.role.is_dashboard());
        assert!(admission.group.is_none());
    }

    #[tokio::test]
    async fn bad_or_missing_credentials_are_rejected() {
        let backend = Arc::new(MemoryBackend::default());
        backend.add_tenant("Acme", "key");
        let gw = gateway_with(&backend, 8);

        let err = gw.authenticate(&HandshakeRequest::default()).await.unwrap_err();
        assert!(matches!(err, Rejection::MissingCredentials));

        let err = gw
            .authenticate(&HandshakeRequest {
                tenant_key: Some("wrong".into()),
                bearer: Some("stale".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Rejection::UnknownTenant));
    }

    #[tokio::test]
    async fn lookup_failure_rejects() {
        let backend = Arc::new(MemoryBackend::default());
        backend.fail_lookups(true);
        let gw = gateway_with(&backend, 8);
        let err = gw
            .authenticate(&HandshakeRequest {
                tenant_key: Some("key".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Rejection::Lookup(_)));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let backend = Arc::new(MemoryBackend::default());
        let gw = gateway_with(&backend, 8);
        let (_, mut rx_a) = gw.register(&agent(Some("a1")));
        let (_, mut rx_d) = gw.register(&dashboard());

        assert_eq!(gw.broadcast_to_all(&kill(1)), 2);
        assert!(rx_a.recv().await.unwrap().contains("\"pid\":1"));
        assert!(rx_d.recv().await.unwrap().contains("\"pid\":1"));
    }

    #[tokio::test]
    async fn group_send_targets_members_only() {
        let backend = Arc::new(MemoryBackend::default());
        let gw = gateway_with(&backend, 8);
        let (_, mut rx_a1) = gw.register(&agent(Some("a1")));
        let (_, mut rx_a2) = gw.register(&agent(Some("a2")));

        assert_eq!(gw.send_to_group("a1", &kill(9)), 1);
        assert!(rx_a1.recv().await.unwrap().contains("\"pid\":9"));
        assert!(rx_a2.try_recv().is_err());
        assert_eq!(gw.send_to_group("nobody", &kill(9)), 0);
    }

    #[tokio::test]
    async fn per_connection_order_is_preserved() {
        let backend = Arc::new(MemoryBackend::default());
        let gw = gateway_with(&backend, 16);
        let (_, mut rx) = gw.register(&dashboard());
        for pid in 0..10 {
            gw.broadcast_to_all(&kill(pid));
        }
        for pid in 0..10 {
            let frame = rx.recv().await.unwrap();
            assert!(frame.contains(&format!("\"pid\":{pid}")));
        }
    }

    #[test]
    fn full_queue_drops_for_that_connection_only() {
        let backend = Arc::new(MemoryBackend::default());
        let gw = gateway_with(&backend, 1);
        let (_, _slow) = gw.register(&dashboard());
        let (_, mut fast) = gw.register(&dashboard());

        assert_eq!(gw.broadcast_to_all(&kill(1)), 2);
        assert!(fast.try_recv().is_ok());
        // The slow reader's queue is still full.
        assert_eq!(gw.broadcast_to_all(&kill(2)), 1);
    }

    #[test]
    fn unregister_cleans_up_groups() {
        let backend = Arc::new(MemoryBackend::default());
        let gw = gateway_with(&backend, 4);
        let (first, _rx1) = gw.register(&agent(Some("a1")));
        let (second, _rx2) = gw.register(&agent(Some("a1")));
        assert_eq!(gw.group_size("a1"), 2);

        assert_eq!(gw.unregister(first), None);
        assert_eq!(gw.group_size("a1"), 1);
        assert_eq!(gw.unregister(second).as_deref(), Some("a1"));
        assert_eq!(gw.unregister(second), None);
        assert_eq!(gw.group_size("a1"), 0);
        assert_eq!(gw.connection_count(), 0);
        assert!(gw.snapshot().groups.is_empty());
    }

    #[test]
    fn snapshot_counts_roles() {
        let backend = Arc::new(MemoryBackend::default());
        let gw = gateway_with(&backend, 4);
        let _a = gw.register(&agent(Some("a1")));
        let _b = gw.register(&agent(None));
        let _d = gw.register(&dashboard());
        let snap = gw.snapshot();
        assert_eq!(snap.dashboards, 1);
        assert_eq!(snap.agents, 2);
        assert_eq!(snap.groups.get("a1"), Some(&1));
    }

    #[test]
    fn concurrent_register_and_broadcast() {
        let backend = Arc::new(MemoryBackend::default());
        let gw = Arc::new(gateway_with(&backend, 64));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gw = Arc::clone(&gw);
                std::thread::spawn(move || {
                    let group = format!("g{}", i % 2);
                    for _ in 0..50 {
                        let (id, _rx) = gw.register(&agent(Some(&group)));
                        gw.broadcast_to_all(&kill(i));
                        gw.send_to_group(&group, &kill(i));
                        gw.unregister(id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(gw.connection_count(), 0);
        assert_eq!(gw.group_size("g0"), 0);
    }
}

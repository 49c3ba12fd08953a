use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    net::TcpStream,
    sync::{RwLock, mpsc},
    time::Instant,
};

use crate::backhaul::{
    telemetry::now_unix_ms,
    tunnel::{protocol::ServerMessage, registry::TunnelQueue},
};

pub type SharedTunnelQueue = Arc<TunnelQueue<TcpStream>>;

/// Last time a control channel produced any inbound line.
#[derive(Debug)]
pub struct Liveness {
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_seen_ms.store(ms, Ordering::Relaxed);
    }

    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// What the control handler keeps after registering.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub tunnels: SharedTunnelQueue,
    pub liveness: Arc<Liveness>,
}

/// What a public session needs to reach a client.
#[derive(Debug, Clone)]
pub struct ClientRoute {
    pub id: String,
    pub tunnels: SharedTunnelQueue,
    pub control: mpsc::Sender<ServerMessage>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub remote: String,
    pub connected_at_unix_ms: u64,
    pub connected_secs: u64,
    pub queued_tunnels: usize,
}

struct ClientConn {
    seq: u64,
    remote: String,
    connected_at: Instant,
    connected_at_unix_ms: u64,
    tunnels: SharedTunnelQueue,
    control: mpsc::Sender<ServerMessage>,
    liveness: Arc<Liveness>,
}

/// The server's client table. Every registration is created and removed here; nothing else
/// holds one past a single lookup.
pub struct Manager {
    id_seq: AtomicU64,
    tunnel_ttl: Duration,
    /// Set by the shutdown drain, always under the table's write lock.
    closed: AtomicBool,
    clients: RwLock<HashMap<String, ClientConn>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

impl Manager {
    /// `tunnel_ttl` bounds how long an unclaimed tunnel may wait in a client's queue.
    pub fn new(tunnel_ttl: Duration) -> Self {
        Self {
            id_seq: AtomicU64::new(1),
            tunnel_ttl,
            closed: AtomicBool::new(false),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn next_client_id(&self) -> (u64, String) {
        let n = self.id_seq.fetch_add(1, Ordering::Relaxed);
        (n, format!("client-{n}"))
    }

    /// Creates a registration with a fresh id and an empty tunnel queue. Returns `None` once
    /// the table has been drained for shutdown.
    pub async fn register_client(
        &self,
        remote: impl Into<String>,
        control: mpsc::Sender<ServerMessage>,
    ) -> Option<Registration> {
        let mut st = self.clients.write().await;
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let (seq, id) = self.next_client_id();
        let tunnels = Arc::new(TunnelQueue::new(self.tunnel_ttl));
        let liveness = Arc::new(Liveness::new());

        let cc = ClientConn {
            seq,
            remote: remote.into(),
            connected_at: Instant::now(),
            connected_at_unix_ms: now_unix_ms(),
            tunnels: tunnels.clone(),
            control,
            liveness: liveness.clone(),
        };
        st.insert(id.clone(), cc);

        Some(Registration {
            id,
            tunnels,
            liveness,
        })
    }

    /// Removes a registration and closes its pending tunnels. Returns false when the id was
    /// already gone, so only one caller ever performs the cleanup for a client.
    pub async fn unregister_client(&self, id: &str) -> bool {
        let Some(old) = self.clients.write().await.remove(id) else {
            return false;
        };
        old.tunnels.close().await;
        true
    }

    /// The oldest live registration. Public traffic always goes here.
    pub async fn first_client(&self) -> Option<ClientRoute> {
        let st = self.clients.read().await;
        st.iter()
            .min_by_key(|(_, cc)| cc.seq)
            .map(|(id, cc)| ClientRoute {
                id: id.clone(),
                tunnels: cc.tunnels.clone(),
                control: cc.control.clone(),
            })
    }

    pub async fn tunnel_queue(&self, id: &str) -> Option<SharedTunnelQueue> {
        self.clients.read().await.get(id).map(|cc| cc.tunnels.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.clients.read().await.contains_key(id)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn snapshot_clients(&self) -> Vec<ClientSnapshot> {
        let mut entries: Vec<(u64, ClientSnapshot, SharedTunnelQueue)> = {
            let st = self.clients.read().await;
            st.iter()
                .map(|(id, cc)| {
                    let snap = ClientSnapshot {
                        client_id: id.clone(),
                        remote: cc.remote.clone(),
                        connected_at_unix_ms: cc.connected_at_unix_ms,
                        connected_secs: cc.connected_at.elapsed().as_secs(),
                        queued_tunnels: 0,
                    };
                    (cc.seq, snap, cc.tunnels.clone())
                })
                .collect()
        };

        entries.sort_by_key(|(seq, _, _)| *seq);
        let mut out = Vec::with_capacity(entries.len());
        for (_, mut snap, q) in entries {
            snap.queued_tunnels = q.len().await;
            out.push(snap);
        }
        out
    }

    /// Ids whose control handler is gone or whose channel has been silent longer than
    /// `max_idle`.
    pub async fn dead_clients(&self, max_idle: Duration) -> Vec<String> {
        let st = self.clients.read().await;
        st.iter()
            .filter(|(_, cc)| cc.control.is_closed() || cc.liveness.idle() > max_idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Discards tunnels that waited longer than the TTL in any queue.
    pub async fn prune_stale_tunnels(&self) -> usize {
        let queues: Vec<SharedTunnelQueue> = {
            let st = self.clients.read().await;
            st.values().map(|cc| cc.tunnels.clone()).collect()
        };
        let mut pruned = 0;
        for q in queues {
            pruned += q.prune().await;
        }
        pruned
    }

    /// Empties the table for shutdown, handing back each client's control outbox. Later
    /// registrations are refused.
    pub async fn drain_for_shutdown(&self) -> Vec<(String, mpsc::Sender<ServerMessage>)> {
        let drained: Vec<(String, ClientConn)> = {
            let mut st = self.clients.write().await;
            self.closed.store(true, Ordering::Release);
            st.drain().collect()
        };
        let mut out = Vec::with_capacity(drained.len());
        for (id, cc) in drained {
            cc.tunnels.close().await;
            out.push((id, cc.control));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Manager {
        Manager::new(Duration::from_secs(30))
    }

    fn outbox() -> (mpsc::Sender<ServerMessage>, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(4)
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let m = manager();
        let (tx, _rx) = outbox();
        let a = m.register_client("1.1.1.1:1", tx.clone()).await.unwrap();
        let b = m.register_client("1.1.1.1:2", tx).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("client-"));
        assert_eq!(m.client_count().await, 2);
    }

    #[tokio::test]
    async fn first_client_is_oldest_registration() {
        let m = manager();
        let (tx, _rx) = outbox();
        let a = m.register_client("a", tx.clone()).await.unwrap();
        let b = m.register_client("b", tx.clone()).await.unwrap();
        let _c = m.register_client("c", tx).await.unwrap();

        assert_eq!(m.first_client().await.unwrap().id, a.id);
        assert!(m.unregister_client(&a.id).await);
        assert_eq!(m.first_client().await.unwrap().id, b.id);
    }

    #[tokio::test]
    async fn unregister_is_one_shot_and_closes_queue() {
        let m = manager();
        let (tx, _rx) = outbox();
        let reg = m.register_client("a", tx).await.unwrap();

        assert!(m.unregister_client(&reg.id).await);
        assert!(!m.unregister_client(&reg.id).await);
        assert!(m.first_client().await.is_none());
        assert!(m.tunnel_queue(&reg.id).await.is_none());
        assert!(reg.tunnels.pop().await.is_none());
    }

    #[tokio::test]
    async fn closed_outbox_marks_client_dead() {
        let m = manager();
        let (tx1, rx1) = outbox();
        let (tx2, _rx2) = outbox();
        let gone = m.register_client("a", tx1).await.unwrap();
        let alive = m.register_client("b", tx2).await.unwrap();
        gone.liveness.touch();
        alive.liveness.touch();

        drop(rx1);
        let dead = m.dead_clients(Duration::from_secs(60)).await;
        assert_eq!(dead, vec![gone.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_marks_dead_after_max_idle() {
        let m = manager();
        let (tx, _rx) = outbox();
        let reg = m.register_client("a", tx).await.unwrap();

        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(m.dead_clients(Duration::from_secs(120)).await.is_empty());

        reg.liveness.touch();
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(m.dead_clients(Duration::from_secs(120)).await.is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(m.dead_clients(Duration::from_secs(120)).await, vec![reg.id]);
    }

    #[tokio::test]
    async fn snapshot_and_drain() {
        let m = manager();
        let (tx, mut rx) = outbox();
        let a = m.register_client("10.0.0.1:5000", tx.clone()).await.unwrap();
        let b = m.register_client("10.0.0.2:5000", tx).await.unwrap();

        let snaps = m.snapshot_clients().await;
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].client_id, a.id);
        assert_eq!(snaps[0].remote, "10.0.0.1:5000");
        assert_eq!(snaps[1].client_id, b.id);
        assert_eq!(snaps[1].queued_tunnels, 0);

        let drained = m.drain_for_shutdown().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(m.client_count().await, 0);

        for (_, out) in &drained {
            out.send(ServerMessage::Shutdown).await.unwrap();
        }
        assert_eq!(rx.recv().await, Some(ServerMessage::Shutdown));
    }

    #[tokio::test]
    async fn registration_is_refused_after_drain() {
        let m = manager();
        let (tx, _rx) = outbox();
        m.register_client("10.0.0.1:5000", tx.clone()).await.unwrap();

        assert_eq!(m.drain_for_shutdown().await.len(), 1);
        assert!(m.register_client("10.0.0.2:5000", tx).await.is_none());
        assert_eq!(m.client_count().await, 0);
        assert!(m.first_client().await.is_none());
    }
}

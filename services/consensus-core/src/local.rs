//! In-process network connecting replicas and clients. Used by the local
//! cluster binary and the integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use mesh_core::PeerId;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::message::Channel;
use crate::messaging::Transport;
use crate::node::ReplicaHandle;

/// Frame as seen by a client inbox.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: PeerId,
    pub channel: Channel,
    pub payload: Vec<u8>,
}

enum Endpoint {
    Replica(ReplicaHandle),
    Client(mpsc::UnboundedSender<Envelope>),
}

#[derive(Default)]
struct Routes {
    endpoints: HashMap<PeerId, Endpoint>,
    down: HashSet<PeerId>,
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<RwLock<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self { Self::default() }

    pub fn register_replica(&self, handle: ReplicaHandle) {
        self.routes.write().endpoints.insert(handle.id(), Endpoint::Replica(handle));
    }

    /// Register a client identity and return its inbox.
    pub fn register_client(&self, id: PeerId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().endpoints.insert(id, Endpoint::Client(tx));
        rx
    }

    /// Transport that sends as `local`.
    pub fn transport(&self, local: PeerId) -> Arc<dyn Transport> { Arc::new(LocalTransport { local, network: self.clone() }) }

    /// Cut a node off: frames to or from it fail from now on.
    pub fn disconnect(&self, peer: PeerId) {
        self.routes.write().down.insert(peer);
        tracing::info!(peer = %peer.short(), "peer_disconnected");
    }

    pub fn reconnect(&self, peer: PeerId) { self.routes.write().down.remove(&peer); }

    fn route(&self, from: PeerId, target: PeerId, channel: Channel, payload: Vec<u8>) -> anyhow::Result<()> {
        let routes = self.routes.read();
        if routes.down.contains(&from) || routes.down.contains(&target) {
            anyhow::bail!("peer {} unreachable", target.short());
        }
        match routes.endpoints.get(&target) {
            Some(Endpoint::Replica(handle)) => Ok(handle.deliver(from, channel, payload)?),
            Some(Endpoint::Client(inbox)) => {
                inbox.send(Envelope { from, channel, payload }).map_err(|_| anyhow::anyhow!("client {} inbox closed", target.short()))
            }
            None => anyhow::bail!("no route to {}", target.short()),
        }
    }
}

struct LocalTransport {
    local: PeerId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_message(&self, target: PeerId, channel: Channel, payload: Vec<u8>) -> anyhow::Result<()> {
        self.network.route(self.local, target, channel, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::Keypair;

    #[tokio::test]
    async fn client_frames_are_routed() {
        let net = LocalNetwork::new();
        let a = Keypair::from_seed([1; 32]).peer_id();
        let b = Keypair::from_seed([2; 32]).peer_id();
        let mut inbox = net.register_client(b);
        net.transport(a).send_message(b, Channel::General, b"hello\n".to_vec()).await.unwrap();
        let env = inbox.recv().await.unwrap();
        assert_eq!(env.from, a);
        assert_eq!(env.channel, Channel::General);
        assert_eq!(env.payload, b"hello\n");
    }

    #[tokio::test]
    async fn disconnected_peers_are_unreachable() {
        let net = LocalNetwork::new();
        let a = Keypair::from_seed([1; 32]).peer_id();
        let b = Keypair::from_seed([2; 32]).peer_id();
        let _inbox = net.register_client(b);
        net.disconnect(b);
        assert!(net.transport(a).send_message(b, Channel::General, vec![]).await.is_err());
        assert!(net.transport(b).send_message(a, Channel::General, vec![]).await.is_err());
        net.reconnect(b);
        assert!(net.transport(a).send_message(b, Channel::General, vec![]).await.is_ok());

        let unknown = Keypair::from_seed([3; 32]).peer_id();
        assert!(net.transport(a).send_message(unknown, Channel::Consensus, vec![]).await.is_err());
    }
}

/// End-to-end cluster tests over the in-memory network.
///
/// Covers the normal ordering path, deferred duplicates and recovery from a
/// crashed primary through a view change.

use std::sync::Arc;
use std::time::Duration;

use consensus_core::local::Envelope;
use consensus_core::{
    spawn_replica, Channel, EchoExecutor, ExecutionRequest, ExecutionResponse, LocalNetwork, Message, ReplicaConfig,
    ReplicaHandle, ReplicaStatus, Request, ResultCode, Transport,
};
use mesh_core::{Keypair, PeerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Cluster {
    network: LocalNetwork,
    peers: Vec<PeerId>,
    handles: Vec<ReplicaHandle>,
    tasks: Vec<JoinHandle<()>>,
    client: PeerId,
    inbox: mpsc::UnboundedReceiver<Envelope>,
}

fn cluster(config: ReplicaConfig) -> Cluster {
    let keys: Vec<Keypair> = (1..=4u8).map(|i| Keypair::from_seed([i; 32])).collect();
    let peers: Vec<PeerId> = keys.iter().map(Keypair::peer_id).collect();
    let network = LocalNetwork::new();
    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for key in keys {
        let transport = network.transport(key.peer_id());
        let (handle, task) = spawn_replica(key, peers.clone(), transport, Arc::new(EchoExecutor), config.clone()).unwrap();
        network.register_replica(handle.clone());
        handles.push(handle);
        tasks.push(task);
    }
    let client = Keypair::from_seed([42; 32]).peer_id();
    let inbox = network.register_client(client);
    Cluster { network, peers, handles, tasks, client, inbox }
}

impl Cluster {
    fn request(&self, name: &str) -> Request {
        Request::new(self.client, ExecutionRequest::new("fn-greet", "greet.wasm").with_parameter("name", name))
    }

    async fn submit(&self, request: &Request) {
        let frame = Message::Request(request.clone()).encode().unwrap();
        let transport = self.network.transport(self.client);
        for peer in &self.peers {
            // crashed replicas are expected to be unreachable
            let _ = transport.send_message(*peer, Channel::General, frame.clone()).await;
        }
    }

    async fn responses(&mut self, count: usize) -> Vec<ExecutionResponse> {
        let mut out = Vec::new();
        while out.len() < count {
            let frame = tokio::time::timeout(Duration::from_secs(10), self.inbox.recv())
                .await
                .expect("timed out waiting for responses")
                .expect("client inbox closed");
            assert_eq!(frame.channel, Channel::General);
            out.push(ExecutionResponse::decode(&frame.payload).unwrap());
        }
        out
    }

    async fn statuses(&self, live: &[usize]) -> Vec<ReplicaStatus> {
        let mut out = Vec::new();
        for i in live {
            out.push(self.handles[*i].status().await.unwrap());
        }
        out
    }

    async fn wait_for(&self, live: &[usize], done: impl Fn(&ReplicaStatus) -> bool) -> Vec<ReplicaStatus> {
        for _ in 0..500 {
            let statuses = self.statuses(live).await;
            if statuses.iter().all(&done) {
                return statuses;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("cluster did not converge: {:?}", self.statuses(live).await);
    }

    async fn shutdown(self) {
        for handle in &self.handles {
            let _ = handle.shutdown();
        }
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

#[tokio::test]
async fn four_replicas_execute_and_reply() {
    let mut c = cluster(ReplicaConfig::default());
    let req = c.request("mesh");
    c.submit(&req).await;

    let responses = c.responses(4).await;
    let mut repliers: Vec<PeerId> = responses.iter().map(|r| r.pbft.replica).collect();
    repliers.sort();
    let mut expected = c.peers.clone();
    expected.sort();
    assert_eq!(repliers, expected);
    for resp in &responses {
        assert_eq!(resp.request_id, req.id);
        assert_eq!(resp.code, ResultCode::Ok);
        assert_eq!(resp.pbft.view, 0);
        assert_eq!(resp.pbft.request_timestamp, req.timestamp);
        assert_eq!(resp.results[&resp.pbft.replica].result.stdout, "fn-greet:greet.wasm(name=mesh)");
    }

    let statuses = c.wait_for(&[0, 1, 2, 3], |s| s.last_executed == 1).await;
    assert!(statuses.iter().all(|s| s.view == 0 && s.pending == 0 && s.active_view));
    c.shutdown().await;
}

#[tokio::test]
async fn requests_execute_in_submission_order() {
    let mut c = cluster(ReplicaConfig::default());
    let first = c.request("one");
    let second = c.request("two");
    c.submit(&first).await;
    c.submit(&second).await;

    let responses = c.responses(8).await;
    for peer in &c.peers {
        let ids: Vec<&str> = responses.iter().filter(|r| r.pbft.replica == *peer).map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);
    }
    c.wait_for(&[0, 1, 2, 3], |s| s.last_executed == 2 && s.sequence == 2).await;
    c.shutdown().await;
}

#[tokio::test]
async fn duplicate_request_gets_cached_response() {
    let mut c = cluster(ReplicaConfig::default());
    let req = c.request("again");
    c.submit(&req).await;
    let first = c.responses(4).await;
    c.wait_for(&[0, 1, 2, 3], |s| s.last_executed == 1).await;

    c.submit(&req).await;
    let second = c.responses(4).await;
    for resp in &second {
        let original = first.iter().find(|r| r.pbft.replica == resp.pbft.replica).unwrap();
        assert_eq!(resp, original);
    }
    let statuses = c.statuses(&[0, 1, 2, 3]).await;
    assert!(statuses.iter().all(|s| s.last_executed == 1 && s.sequence == 1));
    c.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn crashed_primary_is_replaced() {
    let config = ReplicaConfig::default().with_request_timeout(Duration::from_secs(1));
    let mut c = cluster(config);
    let primary = c.peers[0];
    c.network.disconnect(primary);
    c.handles[0].shutdown().unwrap();

    let req = c.request("failover");
    c.submit(&req).await;

    let backups = [1, 2, 3];
    let statuses = c.wait_for(&backups, |s| s.view == 1 && s.active_view).await;
    assert!(statuses.iter().all(|s| s.primary == c.peers[1] && s.last_executed == 0));

    c.submit(&req).await;
    let responses = c.responses(3).await;
    for resp in &responses {
        assert_eq!(resp.request_id, req.id);
        assert_eq!(resp.pbft.view, 1);
        assert_ne!(resp.pbft.replica, primary);
    }
    let statuses = c.wait_for(&backups, |s| s.last_executed == 1).await;
    assert!(statuses.iter().all(|s| s.view == 1 && s.pending == 0));
    c.shutdown().await;
}

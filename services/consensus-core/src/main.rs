use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use consensus_core::{spawn_replica, EchoExecutor, ExecutionRequest, ExecutionResponse, LocalNetwork, Message, ReplicaConfig, Request, Channel, Transport};
use mesh_core::Keypair;
use tracing::{info, warn};

/// Boots an in-process cluster, submits one request and waits for the replies.
#[tokio::main]
async fn main() -> Result<()> {
    let cfg = mesh_core::load_config("consensus-core")?;
    mesh_core::init_tracing_with(&cfg.service_name, cfg.json_log)?;
    info!(cluster_size = cfg.consensus.cluster_size, request_timeout_ms = cfg.consensus.request_timeout_ms, "starting local cluster");

    let keys: Vec<Keypair> = (0..cfg.consensus.cluster_size).map(|_| Keypair::generate()).collect();
    let replicas: Vec<_> = keys.iter().map(Keypair::peer_id).collect();
    let network = LocalNetwork::new();
    let executor = Arc::new(EchoExecutor);

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for key in keys {
        let transport = network.transport(key.peer_id());
        let (handle, task) = spawn_replica(key, replicas.clone(), transport, executor.clone(), ReplicaConfig::from(&cfg.consensus))?;
        network.register_replica(handle.clone());
        handles.push(handle);
        tasks.push(task);
    }

    let client = Keypair::generate().peer_id();
    let mut inbox = network.register_client(client);
    let request = Request::new(client, ExecutionRequest::new("hello-world", "hello.wasm").with_parameter("name", "mesh"));
    let frame = Message::Request(request.clone()).encode()?;
    let transport = network.transport(client);
    for replica in &replicas {
        if let Err(err) = transport.send_message(*replica, Channel::General, frame.clone()).await {
            warn!(replica = %replica.short(), error = %err, "request_send_failed");
        }
    }
    info!(request_id = %request.id, "request submitted");

    let deadline = tokio::time::sleep(Duration::from_millis(cfg.consensus.request_timeout_ms));
    tokio::pin!(deadline);
    let mut received = 0;
    while received < replicas.len() {
        tokio::select! {
            frame = inbox.recv() => {
                let frame = frame.context("client inbox closed")?;
                let response = ExecutionResponse::decode(&frame.payload)?;
                for (replica, result) in &response.results {
                    info!(replica = %replica.short(), view = response.pbft.view, code = ?result.code, stdout = %result.result.stdout, "execution response");
                }
                received += 1;
            }
            _ = &mut deadline => {
                warn!(received, "timed out waiting for responses");
                break;
            }
        }
    }

    for handle in &handles {
        let _ = handle.shutdown();
    }
    for task in tasks {
        task.await?;
    }
    info!(received, "local cluster stopped");
    Ok(())
}

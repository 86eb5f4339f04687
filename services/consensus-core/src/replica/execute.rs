use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::Replica;
use crate::error::{ConsensusError, Result};
use crate::execution::{ExecutionResponse, ExecutionResult};
use crate::message::{MessageId, NULL_DIGEST};

impl Replica {
    /// Execute a committed slot, then any consecutive committed slots that
    /// were waiting behind it.
    pub(crate) async fn execute(&mut self, id: MessageId, digest: &str) -> Result<()> {
        self.execute_slot(id, digest).await?;
        loop {
            let next = MessageId::new(self.state.view, self.state.last_executed + 1);
            let Some(digest) = self.state.preprepare(&next).map(|pp| pp.digest.clone()) else {
                return Ok(());
            };
            if !self.committed(next, &digest) {
                return Ok(());
            }
            let before = self.state.last_executed;
            self.execute_slot(next, &digest).await?;
            if self.state.last_executed == before {
                return Ok(());
            }
        }
    }

    async fn execute_slot(&mut self, id: MessageId, digest: &str) -> Result<()> {
        let expected = self.state.last_executed + 1;
        if digest == NULL_DIGEST {
            if id.sequence == expected {
                self.state.last_executed = id.sequence;
                info!(slot = %id, "null_request_executed");
            } else if id.sequence > expected {
                warn!(slot = %id, last_executed = self.state.last_executed, "null_request_deferred");
            }
            return Ok(());
        }
        let request = self
            .state
            .requests
            .get(digest)
            .cloned()
            .ok_or_else(|| ConsensusError::UnknownRequest { digest: digest.to_string() })?;
        if !self.state.pending.contains_key(digest) {
            debug!(slot = %id, request_id = %request.id, "request_already_executed");
            return Ok(());
        }
        if id.sequence != expected {
            if id.sequence < expected {
                error!(slot = %id, last_executed = self.state.last_executed, "pending_request_behind_last_executed");
            } else {
                warn!(slot = %id, last_executed = self.state.last_executed, "execution_deferred");
            }
            return Ok(());
        }
        self.state.pending.remove(digest);

        let started = Instant::now();
        let mut result = match self.executor.execute(&request.id, &request.execute).await {
            Ok(result) => result,
            Err(err) => {
                error!(request_id = %request.id, error = %err, "executor_failed");
                ExecutionResult::failed(err.to_string())
            }
        };
        if result.usage.wall_clock_ms == 0 {
            result.usage.wall_clock_ms = started.elapsed().as_millis() as u64;
        }

        self.timer.stop();
        if !self.state.pending.is_empty() {
            self.timer.start(false);
        }
        self.state.last_executed = id.sequence;
        info!(slot = %id, request_id = %request.id, code = ?result.code, "request_executed");

        let response = ExecutionResponse::new(self.id, &request.id, result.clone(), id.view, request.timestamp);
        self.state.executions.insert(request.id.clone(), response.clone());
        if let Err(err) = self.messaging.send_response(request.origin, &response).await {
            warn!(request_id = %request.id, origin = %request.origin.short(), error = %err, "response_send_failed");
        }
        for processor in &self.post_processors {
            processor.process(&request.id, &request.origin, &request.execute, &result);
        }
        Ok(())
    }
}

//! Execution request/result types and the executor seam.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mesh_core::PeerId;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub environment: Vec<EnvVar>,
    pub stdin: Option<String>,
    pub permissions: Vec<String>,
    pub timeout_ms: Option<u64>,
}

/// A function invocation as submitted by a client. Field order is part of the
/// digest, do not reorder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub function_id: String,
    pub method: String,
    pub parameters: Vec<Parameter>,
    pub config: ExecutionConfig,
}

impl ExecutionRequest {
    pub fn new(function_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self { function_id: function_id.into(), method: method.into(), ..Default::default() }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter { name: name.into(), value: value.into() });
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    #[default]
    #[serde(rename = "200")]
    Ok,
    #[serde(rename = "500")]
    Error,
    #[serde(rename = "408")]
    Timeout,
    #[serde(rename = "503")]
    NotAvailable,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub log: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub wall_clock_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub code: ResultCode,
    pub result: RuntimeOutput,
    pub usage: Usage,
}

impl ExecutionResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { code: ResultCode::Ok, result: RuntimeOutput { stdout: stdout.into(), ..Default::default() }, ..Default::default() }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Error,
            result: RuntimeOutput { stderr: reason.into(), exit_code: -1, ..Default::default() },
            ..Default::default()
        }
    }
}

/// Function execution backend. Called once per committed request, in
/// sequence order, while the replica is otherwise idle.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request_id: &str, request: &ExecutionRequest) -> anyhow::Result<ExecutionResult>;
}

/// PBFT metadata attached to a response so clients can match results per view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultInfo {
    pub view: u64,
    pub request_timestamp: DateTime<Utc>,
    pub replica: PeerId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    #[default]
    MsgExecuteResponse,
}

/// Reply sent by every replica to the origin of an executed request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    pub code: ResultCode,
    pub request_id: String,
    pub results: BTreeMap<PeerId, ExecutionResult>,
    pub pbft: ResultInfo,
}

impl ExecutionResponse {
    pub fn new(replica: PeerId, request_id: &str, result: ExecutionResult, view: u64, request_timestamp: DateTime<Utc>) -> Self {
        let code = result.code;
        let mut results = BTreeMap::new();
        results.insert(replica, result);
        Self {
            kind: ResponseType::MsgExecuteResponse,
            code,
            request_id: request_id.to_string(),
            results,
            pbft: ResultInfo { view, request_timestamp, replica },
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(b'\n');
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> { serde_json::from_slice(trim_frame(bytes)) }
}

pub(crate) fn trim_frame(bytes: &[u8]) -> &[u8] {
    match bytes.iter().rposition(|b| !b.is_ascii_whitespace()) {
        Some(end) => &bytes[..=end],
        None => &bytes[..0],
    }
}

/// Executor that echoes the method and parameters back. Used by the local
/// cluster binary and tests.
#[derive(Clone, Debug, Default)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, _request_id: &str, request: &ExecutionRequest) -> anyhow::Result<ExecutionResult> {
        let args: Vec<String> = request.parameters.iter().map(|p| format!("{}={}", p.name, p.value)).collect();
        Ok(ExecutionResult::ok(format!("{}:{}({})", request.function_id, request.method, args.join(","))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::Keypair;

    #[test]
    fn result_codes_use_status_strings() {
        assert_eq!(serde_json::to_string(&ResultCode::Ok).unwrap(), "\"200\"");
        assert_eq!(serde_json::to_string(&ResultCode::Timeout).unwrap(), "\"408\"");
        let code: ResultCode = serde_json::from_str("\"503\"").unwrap();
        assert_eq!(code, ResultCode::NotAvailable);
    }

    #[test]
    fn response_is_newline_framed() {
        let replica = Keypair::from_seed([3u8; 32]).peer_id();
        let resp = ExecutionResponse::new(replica, "req-1", ExecutionResult::ok("hi"), 2, Utc::now());
        let bytes = resp.encode().unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "MsgExecuteResponse");
        assert_eq!(json["code"], "200");
        assert_eq!(ExecutionResponse::decode(&bytes).unwrap(), resp);
    }

    #[tokio::test]
    async fn echo_executor_formats_call() {
        let req = ExecutionRequest::new("fn-hello", "hello.wasm").with_parameter("name", "mesh");
        let res = EchoExecutor.execute("r", &req).await.unwrap();
        assert_eq!(res.code, ResultCode::Ok);
        assert_eq!(res.result.stdout, "fn-hello:hello.wasm(name=mesh)");
    }
}

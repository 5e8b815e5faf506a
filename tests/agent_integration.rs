//! End-to-end test of the agent's RPC surface over a real loopback
//! connection: binds `AgentServiceImpl` on an ephemeral port, connects with a
//! generated client, and exercises `GetStatus` and `StreamInference`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Endpoint, Server, Uri};

use titancompute_agent::config::AgentConfig;
use titancompute_agent::model_manager::ModelManager;
use titancompute_agent::proto::titancompute::agent_service_client::AgentServiceClient;
use titancompute_agent::proto::titancompute::agent_service_server::AgentServiceServer;
use titancompute_agent::proto::titancompute::{AgentStatusRequest, StreamRequest};
use titancompute_agent::server::AgentServiceImpl;
use titancompute_agent::telemetry::TelemetryProbe;
use titancompute_agent::token::TokenValidator;

fn test_config() -> Arc<AgentConfig> {
    Arc::new(AgentConfig {
        agent_id: "agent-integration".to_string(),
        coordinator_endpoint: "localhost:50051".to_string(),
        public_host: "localhost".to_string(),
        listen_port: 0,
        backend_url: "http://localhost:11434".to_string(),
        max_concurrent_jobs: 4,
        supported_models: vec!["llama3.1".to_string()],
        heartbeat_period_secs: 10,
    })
}

async fn spawn_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = test_config();
    let telemetry = Arc::new(TelemetryProbe::new());
    let manager = Arc::new(ModelManager::new(config.backend_url.clone(), telemetry.clone()));
    let validator = Arc::new(RwLock::new(TokenValidator::new()));
    let service = AgentServiceImpl::new(config, manager, validator, telemetry);

    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(AgentServiceServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    (addr, handle)
}

async fn connect(addr: SocketAddr) -> AgentServiceClient<tonic::transport::Channel> {
    let uri: Uri = format!("http://{addr}").parse().unwrap();
    let channel = Endpoint::from(uri)
        .connect_timeout(Duration::from_secs(5))
        .connect()
        .await
        .expect("test server should accept connections");
    AgentServiceClient::new(channel)
}

#[tokio::test]
async fn get_status_round_trips_over_loopback() {
    let (addr, _handle) = spawn_server().await;
    let mut client = connect(addr).await;

    let response = client
        .get_status(AgentStatusRequest {})
        .await
        .expect("GetStatus should succeed")
        .into_inner();

    assert_eq!(response.agent_id, "agent-integration");
    assert_eq!(response.status, "healthy");
    assert_eq!(response.active_sessions, 0);
}

#[tokio::test]
async fn stream_inference_rejects_unauthenticated_client() {
    let (addr, _handle) = spawn_server().await;
    let mut client = connect(addr).await;

    let request = StreamRequest {
        session_token: "nope".to_string(),
        model: "llama3.1".to_string(),
        prompt: "hello".to_string(),
        options: HashMap::new(),
    };

    let result = client.stream_inference(request).await;
    let status = result.expect_err("short token must be rejected before a stream opens");
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
}

/// Requires a running Ollama-compatible backend at `OLLAMA_HOST` (or
/// `http://localhost:11434`) with at least one model pulled. Not run by
/// default.
#[tokio::test]
#[ignore]
async fn stream_inference_yields_chunks_against_live_backend() {
    use futures::StreamExt;

    let (addr, _handle) = spawn_server().await;
    let mut client = connect(addr).await;

    let request = StreamRequest {
        session_token: "a-token-long-enough-for-fallback-mode".to_string(),
        model: "llama3.1".to_string(),
        prompt: "say hi".to_string(),
        options: HashMap::new(),
    };

    let mut stream = client
        .stream_inference(request)
        .await
        .expect("authenticated request should open a stream")
        .into_inner();

    let mut saw_done = false;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.expect("backend chunk should decode");
        if chunk.done {
            saw_done = true;
            break;
        }
    }
    assert!(saw_done, "stream should terminate with a done chunk");
}

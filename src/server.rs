//! tonic server implementing `AgentService`: `StreamInference` and
//! `GetStatus`. Binds the token validator, model manager, and session
//! bookkeeping together.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::model_manager::ModelManager;
use crate::proto::titancompute::agent_service_server::AgentService;
use crate::proto::titancompute::{
    AgentStatusRequest, AgentStatusResponse, StreamRequest, StreamResponse,
};
use crate::telemetry::TelemetryProbe;
use crate::token::TokenValidator;

struct Session {
    #[allow(dead_code)]
    token: String,
    #[allow(dead_code)]
    model: String,
    #[allow(dead_code)]
    started_at: Instant,
}

pub struct AgentServiceImpl {
    config: Arc<AgentConfig>,
    model_manager: Arc<ModelManager>,
    validator: Arc<RwLock<TokenValidator>>,
    telemetry: Arc<TelemetryProbe>,
    active_sessions: Arc<RwLock<HashMap<String, Session>>>,
    active_session_count: Arc<AtomicU64>,
    total_requests: Arc<AtomicU64>,
}

impl AgentServiceImpl {
    pub fn new(
        config: Arc<AgentConfig>,
        model_manager: Arc<ModelManager>,
        validator: Arc<RwLock<TokenValidator>>,
        telemetry: Arc<TelemetryProbe>,
    ) -> Self {
        Self {
            config,
            model_manager,
            validator,
            telemetry,
            active_sessions: Arc::new(RwLock::new(HashMap::new())),
            active_session_count: Arc::new(AtomicU64::new(0)),
            total_requests: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A cheap, lock-free handle to the current number of active sessions,
    /// for the coordinator heartbeat loop's `running_jobs` field.
    pub fn active_session_counter(&self) -> Arc<AtomicU64> {
        self.active_session_count.clone()
    }
}

#[tonic::async_trait]
impl AgentService for AgentServiceImpl {
    type StreamInferenceStream =
        Pin<Box<dyn tokio_stream::Stream<Item = Result<StreamResponse, Status>> + Send + 'static>>;

    async fn stream_inference(
        &self,
        request: Request<StreamRequest>,
    ) -> Result<Response<Self::StreamInferenceStream>, Status> {
        let req = request.into_inner();

        let validator = self.validator.read().await;
        let claims = validator.validate(&req.session_token, &self.config.agent_id);
        drop(validator);

        if claims.is_none() {
            return Err(Status::unauthenticated("invalid session token"));
        }

        let session_id = Uuid::new_v4().to_string();
        self.active_sessions.write().await.insert(
            session_id.clone(),
            Session {
                token: req.session_token.clone(),
                model: req.model.clone(),
                started_at: Instant::now(),
            },
        );
        self.active_session_count.fetch_add(1, Ordering::SeqCst);

        tracing::info!(session_id = %session_id, "starting inference session");

        let (tx, rx) = mpsc::channel::<Result<StreamResponse, Status>>(32);

        let model_manager = self.model_manager.clone();
        let active_sessions = self.active_sessions.clone();
        let active_session_count = self.active_session_count.clone();
        let total_requests = self.total_requests.clone();
        let session_id_task = session_id.clone();
        let session_token = req.session_token.clone();
        let model = req.model.clone();
        let prompt = req.prompt;
        let options = req.options;

        tokio::spawn(async move {
            let result = async {
                use futures::StreamExt;

                let mut chunks = model_manager
                    .stream_inference(&model, &prompt, options)
                    .await?;
                futures::pin_mut!(chunks);

                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk?;
                    let mut metadata = HashMap::new();
                    metadata.insert("model".to_string(), model.clone());
                    metadata.insert("session_id".to_string(), session_id_task.clone());

                    let response = StreamResponse {
                        session_token: session_token.clone(),
                        content: chunk.response.clone(),
                        done: chunk.done,
                        token: chunk.response,
                        created_at: chrono::Utc::now().timestamp_millis(),
                        metadata,
                    };

                    let is_done = response.done;
                    if tx.send(Ok(response)).await.is_err() {
                        // Peer went away; stop reading from the backend.
                        break;
                    }
                    if is_done {
                        break;
                    }
                }

                Ok::<(), anyhow::Error>(())
            }
            .await;

            if let Err(e) = result {
                tracing::error!(session_id = %session_id_task, error = %e, "inference failed");
                let _ = tx
                    .send(Err(Status::internal(format!("inference failed: {e}"))))
                    .await;
            }

            active_sessions.write().await.remove(&session_id_task);
            active_session_count.fetch_sub(1, Ordering::SeqCst);
            total_requests.fetch_add(1, Ordering::SeqCst);
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_status(
        &self,
        _request: Request<AgentStatusRequest>,
    ) -> Result<Response<AgentStatusResponse>, Status> {
        let sample = self.telemetry.sample();
        let system_status = self.model_manager.system_status().await;
        let validator = self.validator.read().await;

        let mut capabilities = HashMap::new();
        capabilities.insert("quantization_support".to_string(), "enabled".to_string());
        capabilities.insert(
            "total_models".to_string(),
            self.model_manager.loaded_model_count().await.to_string(),
        );
        capabilities.insert(
            "jwt_validation".to_string(),
            if validator.is_configured() { "enabled" } else { "fallback" }.to_string(),
        );
        capabilities.insert(
            "memory_tier".to_string(),
            system_status
                .get("quantization")
                .and_then(|q| q.get("system_memory"))
                .and_then(|m| m.get("recommended_tier"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
        );
        capabilities.insert(
            "is_arm".to_string(),
            system_status
                .get("system_info")
                .and_then(|s| s.get("is_arm"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
                .to_string(),
        );

        let response = AgentStatusResponse {
            agent_id: self.config.agent_id.clone(),
            status: "healthy".to_string(),
            free_vram_mb: sample.free_vram_mb,
            free_ram_mb: sample.free_ram_mb,
            active_sessions: self.active_sessions.read().await.len() as u32,
            total_requests_processed: self.total_requests.load(Ordering::SeqCst),
            model_loaded: self.model_manager.loaded_models_joined().await,
            capabilities,
        };

        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn test_config() -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            agent_id: "agent-test".to_string(),
            coordinator_endpoint: "localhost:50051".to_string(),
            public_host: "localhost".to_string(),
            listen_port: 0,
            backend_url: "http://localhost:11434".to_string(),
            max_concurrent_jobs: 4,
            supported_models: vec!["llama3.1".to_string()],
            heartbeat_period_secs: 10,
        })
    }

    #[tokio::test]
    async fn stream_inference_rejects_short_fallback_token() {
        let config = test_config();
        let telemetry = Arc::new(TelemetryProbe::new());
        let manager = Arc::new(ModelManager::new(config.backend_url.clone(), telemetry.clone()));
        let validator = Arc::new(RwLock::new(TokenValidator::new()));
        let service = AgentServiceImpl::new(config, manager, validator, telemetry);

        let request = Request::new(StreamRequest {
            session_token: "short".to_string(),
            model: "llama3.1".to_string(),
            prompt: "hi".to_string(),
            options: HashMap::new(),
        });

        let result = service.stream_inference(request).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test]
    async fn get_status_reports_zero_sessions_when_idle() {
        let config = test_config();
        let telemetry = Arc::new(TelemetryProbe::new());
        let manager = Arc::new(ModelManager::new(config.backend_url.clone(), telemetry.clone()));
        let validator = Arc::new(RwLock::new(TokenValidator::new()));
        let service = AgentServiceImpl::new(config, manager, validator, telemetry);

        let response = service
            .get_status(Request::new(AgentStatusRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.active_sessions, 0);
        assert_eq!(response.status, "healthy");
        assert_eq!(response.capabilities.get("jwt_validation").unwrap(), "fallback");
    }
}

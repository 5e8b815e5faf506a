//! Coordinator client: registration, public-key fetch, and the periodic
//! health-reporting loop. Owns the connection to the coordinator and the
//! shared handle to the token validator so a successful key fetch can
//! reconfigure it in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};

use crate::config::AgentConfig;
use crate::proto::titancompute::coordinator_service_client::CoordinatorServiceClient;
use crate::proto::titancompute::{AgentRegistration, HealthUpdate, PublicKeyRequest};
use crate::telemetry::TelemetryProbe;
use crate::token::TokenValidator;

const COORDINATOR_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COORDINATOR_CALL_TIMEOUT: Duration = Duration::from_secs(60);
const HEARTBEAT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Init,
    Registered,
    AuthenticatingReady,
    AuthenticatingFallback,
    Healthy,
}

pub struct CoordinatorClient {
    stub: CoordinatorServiceClient<Channel>,
    config: Arc<AgentConfig>,
    validator: Arc<RwLock<TokenValidator>>,
    telemetry: Arc<TelemetryProbe>,
    state: RwLock<AgentState>,
}

impl CoordinatorClient {
    /// Connects to the coordinator. Connection failure here is fatal to the
    /// agent process (see SPEC_FULL §7). `telemetry` is the same shared probe
    /// used by the rest of the process, so registration reports real
    /// hardware capability rather than hardcoded placeholders.
    pub async fn connect(
        config: Arc<AgentConfig>,
        validator: Arc<RwLock<TokenValidator>>,
        telemetry: Arc<TelemetryProbe>,
    ) -> anyhow::Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", config.coordinator_endpoint))?
            .connect_timeout(COORDINATOR_CONNECT_TIMEOUT)
            .timeout(COORDINATOR_CALL_TIMEOUT);
        let channel = endpoint.connect().await?;
        let stub = CoordinatorServiceClient::new(channel);

        Ok(Self {
            stub,
            config,
            validator,
            telemetry,
            state: RwLock::new(AgentState::Init),
        })
    }

    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    /// Registers this agent with the coordinator. Fatal on failure: the
    /// caller should exit the process if this returns an error.
    pub async fn register(&self) -> anyhow::Result<()> {
        let sample = self.telemetry.sample();

        let mut capabilities = HashMap::new();
        capabilities.insert(
            "gpu_available".to_string(),
            (sample.total_vram_mb > 0).to_string(),
        );
        capabilities.insert("backend_url".to_string(), self.config.backend_url.clone());

        let registration = AgentRegistration {
            agent_id: self.config.agent_id.clone(),
            endpoint: self.config.public_endpoint(),
            total_vram_mb: sample.total_vram_mb,
            total_ram_mb: sample.total_ram_mb,
            max_jobs: self.config.max_concurrent_jobs,
            supported_models: self.config.supported_models.clone(),
            capabilities,
        };

        let mut stub = self.stub.clone();
        let response = stub.register_agent(registration).await?;
        tracing::info!(status = %response.into_inner().status, "registered with coordinator");

        *self.state.write().await = AgentState::Registered;
        Ok(())
    }

    /// Fetches the coordinator's public key and configures the token
    /// validator. On failure, logs a warning and leaves the validator in
    /// fallback mode — this is not fatal.
    pub async fn configure_jwt_validation(&self) {
        let mut stub = self.stub.clone();
        match stub.get_public_key(PublicKeyRequest {}).await {
            Ok(response) => {
                let response = response.into_inner();
                let mut validator = self.validator.write().await;
                match validator.set_public_key(&response.public_key_pem) {
                    Ok(()) => {
                        tracing::info!(
                            algorithm = %response.algorithm,
                            issuer = %response.issuer,
                            "JWT validation configured"
                        );
                        *self.state.write().await = AgentState::AuthenticatingReady;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to configure JWT public key, falling back to basic validation");
                        *self.state.write().await = AgentState::AuthenticatingFallback;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "JWT configuration failed, falling back to basic validation");
                *self.state.write().await = AgentState::AuthenticatingFallback;
            }
        }
    }

    /// Runs forever, reporting health at `heartbeat_period_secs` intervals.
    /// Transient failures are logged and retried after a fixed delay; this
    /// loop never terminates on its own.
    pub async fn run_heartbeat_loop(&self, running_jobs: impl Fn() -> usize + Send + Sync + 'static) {
        *self.state.write().await = AgentState::Healthy;
        loop {
            match self.report_health(&running_jobs).await {
                Ok(()) => {
                    tokio::time::sleep(Duration::from_secs(self.config.heartbeat_period_secs)).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "health reporting failed");
                    tokio::time::sleep(HEARTBEAT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn report_health(
        &self,
        running_jobs: &(impl Fn() -> usize + Send + Sync),
    ) -> anyhow::Result<()> {
        let sample = self.telemetry.sample();
        let start = Instant::now();

        let update = HealthUpdate {
            agent_id: self.config.agent_id.clone(),
            free_vram_mb: sample.free_vram_mb,
            free_ram_mb: sample.free_ram_mb,
            running_jobs: running_jobs() as u32,
            queued_jobs: 0,
            cpu_percent: sample.cpu_percent,
            rtt_ms: 0.0,
            timestamp: sample.sample_timestamp,
        };

        let mut stub = self.stub.clone();
        let outbound = tokio_stream::once(update);
        let mut response = stub.report_health(outbound).await?.into_inner();

        if let Some(ack) = tokio_stream::StreamExt::next(&mut response).await {
            let ack = ack?;
            let rtt_ms = crate::model_manager::elapsed_ms(start);
            tracing::debug!(status = %ack.status, rtt_ms, "health ack received");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_init() {
        // state() requires an instance; this test documents the enum's
        // intended transition order instead of constructing a live client,
        // since that needs a reachable coordinator endpoint.
        assert_ne!(AgentState::Init, AgentState::Healthy);
        assert_ne!(AgentState::AuthenticatingReady, AgentState::AuthenticatingFallback);
    }
}

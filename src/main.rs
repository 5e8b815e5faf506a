use std::sync::Arc;

use tokio::sync::RwLock;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use titancompute_agent::config::AgentConfig;
use titancompute_agent::coordinator::CoordinatorClient;
use titancompute_agent::model_manager::ModelManager;
use titancompute_agent::proto::titancompute::agent_service_server::AgentServiceServer;
use titancompute_agent::server::AgentServiceImpl;
use titancompute_agent::telemetry::TelemetryProbe;
use titancompute_agent::token::TokenValidator;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("titancompute_agent=info".parse().unwrap()))
        .init();

    let config = Arc::new(AgentConfig::from_env());
    tracing::info!(agent_id = %config.agent_id, port = config.listen_port, "starting TitanCompute agent");

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "agent exited with fatal error");
        std::process::exit(1);
    }
}

async fn run(config: Arc<AgentConfig>) -> anyhow::Result<()> {
    // Constructed once, up front: owns the process-wide sysinfo/NVML handles
    // and is shared by the model manager, the RPC server, and the
    // coordinator client rather than recreated per caller.
    let telemetry = Arc::new(TelemetryProbe::new());

    let model_manager = Arc::new(ModelManager::new(config.backend_url.clone(), telemetry.clone()));
    let validator = Arc::new(RwLock::new(TokenValidator::new()));

    model_manager.preload(&config.supported_models).await;

    let service = AgentServiceImpl::new(
        config.clone(),
        model_manager.clone(),
        validator.clone(),
        telemetry.clone(),
    );
    let session_counter = service.active_session_counter();

    let listen_addr = format!("0.0.0.0:{}", config.listen_port).parse()?;
    let serve_task = tokio::spawn(async move {
        tracing::info!(addr = %listen_addr, "agent RPC server listening");
        Server::builder()
            .add_service(AgentServiceServer::new(service))
            .serve(listen_addr)
            .await
    });

    // Registration failure is fatal: the agent cannot function unrouted.
    let coordinator =
        CoordinatorClient::connect(config.clone(), validator.clone(), telemetry.clone()).await?;
    coordinator.register().await?;

    // Public-key fetch failure degrades to fallback validation; not fatal.
    coordinator.configure_jwt_validation().await;

    tracing::info!(agent_id = %config.agent_id, port = config.listen_port, "agent ready");

    let heartbeat_task = tokio::spawn(async move {
        coordinator
            .run_heartbeat_loop(move || session_counter.load(std::sync::atomic::Ordering::SeqCst) as usize)
            .await;
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping agent");

    heartbeat_task.abort();
    serve_task.abort();

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

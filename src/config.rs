//! Agent configuration loaded from environment variables.

/// Immutable configuration for one agent process, built once at start-up.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub coordinator_endpoint: String,
    pub public_host: String,
    pub listen_port: u16,
    pub backend_url: String,
    pub max_concurrent_jobs: u32,
    pub supported_models: Vec<String>,
    pub heartbeat_period_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AgentConfig {
    /// Load configuration from the process environment, falling back to the
    /// same defaults as the original agent.
    pub fn from_env() -> Self {
        let supported_models = env_or("SUPPORTED_MODELS", "llama3.1:8b-instruct-q4_k_m")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            agent_id: env_or("AGENT_ID", "agent-1"),
            coordinator_endpoint: env_or("COORDINATOR_ENDPOINT", "localhost:50051"),
            public_host: env_or("PUBLIC_HOST", "localhost"),
            listen_port: env_parse_or("AGENT_PORT", 50052),
            backend_url: env_or("OLLAMA_HOST", "http://localhost:11434"),
            max_concurrent_jobs: env_parse_or("MAX_CONCURRENT_JOBS", 4),
            supported_models,
            heartbeat_period_secs: env_parse_or("HEARTBEAT_INTERVAL", 10),
        }
    }

    /// The address this agent advertises to the coordinator.
    pub fn public_endpoint(&self) -> String {
        format!("{}:{}", self.public_host, self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Relies on these vars not being set in the test environment; if the
        // suite is run with them exported the assertions below would need
        // the actual values, which is an acceptable limitation here.
        let had = std::env::var("AGENT_ID").ok();
        std::env::remove_var("AGENT_ID");
        let cfg = AgentConfig::from_env();
        assert_eq!(cfg.agent_id, "agent-1");
        assert_eq!(cfg.listen_port, 50052);
        assert_eq!(cfg.backend_url, "http://localhost:11434");
        assert_eq!(cfg.supported_models, vec!["llama3.1:8b-instruct-q4_k_m"]);
        if let Some(v) = had {
            std::env::set_var("AGENT_ID", v);
        }
    }

    #[test]
    fn splits_supported_models_on_comma_and_trims() {
        std::env::set_var("SUPPORTED_MODELS", "llama3.1:8b , mistral:7b,qwen2:7b ");
        let cfg = AgentConfig::from_env();
        assert_eq!(
            cfg.supported_models,
            vec!["llama3.1:8b", "mistral:7b", "qwen2:7b"]
        );
        std::env::remove_var("SUPPORTED_MODELS");
    }

    #[test]
    fn public_endpoint_joins_host_and_port() {
        let mut cfg = AgentConfig::from_env();
        cfg.public_host = "10.0.0.5".into();
        cfg.listen_port = 9000;
        assert_eq!(cfg.public_endpoint(), "10.0.0.5:9000");
    }
}

//! Coordinates model pulls against the local inference backend, maps
//! requested model ids to the concrete quantized variant actually loaded,
//! and multiplexes streaming inference calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::quantization::{self, Tier};
use crate::telemetry::TelemetryProbe;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(300);
const SYSTEM_RESERVE_MB: f64 = 1024.0;
const MIN_FREE_MARGIN_MB: i64 = 1024;
const UNQUANTIZED_SIZE_ASSUMPTION_MB: u64 = 8000;
/// Used to search the backend listing for *any* existing smaller variant,
/// ignoring the current memory budget — the emergency-fallback path needs
/// the unconstrained result, not the one already rejected by the caller.
const UNCONSTRAINED_MEMORY_MB: f64 = f64::MAX;

/// One chunk of a streaming `/api/generate` response. Backend chunks are
/// duck-typed JSON; only `response`/`done` are load-bearing, everything else
/// is preserved verbatim for the metadata map.
#[derive(Debug, Clone)]
pub struct InferenceChunk {
    pub response: String,
    pub done: bool,
    pub raw: Value,
}

pub struct ModelManager {
    client: reqwest::Client,
    backend_url: String,
    telemetry: Arc<TelemetryProbe>,
    loaded_models: RwLock<Vec<String>>,
    model_registry: RwLock<HashMap<String, String>>,
    pulls_in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl ModelManager {
    /// `telemetry` is shared with the rest of the process — it owns the
    /// process-wide `sysinfo`/NVML handles and must not be constructed fresh
    /// per caller.
    pub fn new(backend_url: impl Into<String>, telemetry: Arc<TelemetryProbe>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client builds with static config");

        Self {
            client,
            backend_url: backend_url.into(),
            telemetry,
            loaded_models: RwLock::new(Vec::new()),
            model_registry: RwLock::new(HashMap::new()),
            pulls_in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Preloads each requested model with an intelligent quantization
    /// choice. Individual failures are logged and skipped; preload never
    /// fails the process.
    pub async fn preload(&self, models: &[String]) {
        for model in models {
            tracing::info!(model = %model, "preloading model");
            match self.select_optimal_model_variant(model).await {
                Ok(optimal) => match self.ensure_pulled(&optimal).await {
                    Ok(()) => {
                        self.loaded_models.write().await.push(optimal.clone());
                        self.model_registry
                            .write()
                            .await
                            .insert(model.clone(), optimal.clone());
                        tracing::info!(variant = %optimal, "preloaded model");
                    }
                    Err(e) => {
                        tracing::error!(model = %model, error = %e, "failed to preload model");
                    }
                },
                Err(e) => {
                    tracing::error!(model = %model, error = %e, "failed to select variant for model");
                }
            }
        }
    }

    fn usable_memory_mb(&self, free_mb: u64) -> f64 {
        let free = free_mb as f64;
        (free - SYSTEM_RESERVE_MB).max(free * 0.8)
    }

    /// Selects the optimal quantized variant of a base model. Prefers an
    /// existing backend variant over downloading a new one (memory-safety
    /// first rule).
    pub async fn select_optimal_model_variant(&self, base_model: &str) -> anyhow::Result<String> {
        let sample = self.telemetry.sample();
        let usable = self.usable_memory_mb(sample.free_ram_mb);

        tracing::info!(
            total_mb = sample.total_ram_mb,
            free_mb = sample.free_ram_mb,
            usable_mb = usable,
            "system memory sampled for variant selection"
        );

        if quantization::contains_known_format(base_model) {
            tracing::info!(model = %base_model, "model already has quantization suffix, using as-is");
            return Ok(base_model.to_string());
        }

        if let Some(existing) = self.find_existing_quantized_model(base_model, usable).await? {
            tracing::info!(variant = %existing, "using existing quantized model, no download needed");
            return Ok(existing);
        }

        let optimal = quantization::build_variant_id_auto(base_model, usable as u64);
        let format = optimal.rsplit(':').next().unwrap_or_default().to_uppercase();
        let tier = quantization::tier_for(usable as u64);
        if let Some(info) = quantization::quantization_info(&format) {
            tracing::info!(
                format = %format,
                tier = tier.as_str(),
                quality = info.quality_score,
                "no existing quantized model found, will download"
            );
        }

        Ok(optimal)
    }

    /// Estimates memory usage for a model name, defaulting to `Q4_K_M` when
    /// the name carries no explicit quantization tag.
    pub fn memory_usage_estimate_mb(&self, model_name: &str) -> u64 {
        let format = model_name
            .rsplit_once(':')
            .map(|(_, fmt)| fmt.to_uppercase())
            .unwrap_or_else(|| "Q4_K_M".to_string());
        quantization::estimate_memory(model_name, &format)
    }

    /// `(free - estimate) > 1024`.
    pub async fn can_load(&self, variant_id: &str) -> bool {
        let sample = self.telemetry.sample();
        let estimated = self.memory_usage_estimate_mb(variant_id) as i64;
        let can_load = (sample.free_ram_mb as i64 - estimated) > MIN_FREE_MARGIN_MB;
        tracing::debug!(
            variant = %variant_id,
            estimated_mb = estimated,
            free_mb = sample.free_ram_mb,
            can_load,
            "memory check"
        );
        can_load
    }

    /// Searches the backend's model listing for an existing variant of
    /// `base_model` that fits within `usable_mb`, scored by
    /// `0.6*quality + 0.4*memory_efficiency`.
    async fn find_existing_quantized_model(
        &self,
        base_model: &str,
        usable_mb: f64,
    ) -> anyhow::Result<Option<String>> {
        let available = self.list_models().await;
        let base_name = base_model.split_once(':').map(|(b, _)| b).unwrap_or(base_model);

        let mut scored: Vec<(String, f64)> = Vec::new();
        for entry in &available {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            if !name.starts_with(base_name) {
                continue;
            }

            if let Some((_, suffix)) = name.split_once(':') {
                let format = suffix.to_uppercase();
                if let Some(info) = quantization::quantization_info(&format) {
                    let estimated = quantization::estimate_memory(base_name, &format) as f64;
                    if estimated <= usable_mb {
                        let memory_efficiency = 1.0 - (estimated / usable_mb);
                        let score = info.quality_score * 0.6 + memory_efficiency * 0.4;
                        scored.push((name.to_string(), score));
                    }
                }
            } else if UNQUANTIZED_SIZE_ASSUMPTION_MB as f64 <= usable_mb {
                scored.push((name.to_string(), 1.0));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        Ok(scored.into_iter().next().map(|(name, _)| name))
    }

    /// Ensures `variant_id` is present at the backend, pulling it if
    /// necessary. De-duplicates concurrent pulls of the same variant.
    async fn ensure_pulled(&self, variant_id: &str) -> anyhow::Result<()> {
        let names = self.list_models().await;
        if names.iter().any(|m| m.get("name").and_then(Value::as_str) == Some(variant_id)) {
            tracing::info!(variant = %variant_id, "model already exists at backend");
            return Ok(());
        }

        let notify = {
            let mut in_flight = self.pulls_in_flight.lock().await;
            if let Some(existing) = in_flight.get(variant_id) {
                let existing = existing.clone();
                drop(in_flight);
                existing.notified().await;
                return Ok(());
            }
            let notify = Arc::new(Notify::new());
            in_flight.insert(variant_id.to_string(), notify.clone());
            notify
        };

        let result = self.pull_model(variant_id).await;

        {
            let mut in_flight = self.pulls_in_flight.lock().await;
            in_flight.remove(variant_id);
        }
        notify.notify_waiters();

        result
    }

    /// Downloads a model if not already present, following the backend's
    /// line-delimited JSON progress stream.
    pub async fn pull_model(&self, model_name: &str) -> anyhow::Result<()> {
        use futures::StreamExt;

        let response = self
            .client
            .post(format!("{}/api/pull", self.backend_url))
            .json(&serde_json::json!({ "name": model_name }))
            .send()
            .await?
            .error_for_status()?;

        let mut stream = response.bytes_stream();
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].to_string();
                buf.drain(..=pos);
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(data) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if let Some(status) = data.get("status").and_then(Value::as_str) {
                    tracing::debug!(status, "pull status");
                }
                if let Some(error) = data.get("error").and_then(Value::as_str) {
                    anyhow::bail!("backend reported pull error: {error}");
                }
            }
        }

        Ok(())
    }

    /// Produces a finite stream of backend chunks for `model`/`prompt`,
    /// resolving `model` to a loaded variant first (pulling one if needed).
    pub async fn stream_inference(
        &self,
        model: &str,
        prompt: &str,
        options: HashMap<String, String>,
    ) -> anyhow::Result<impl futures::Stream<Item = anyhow::Result<InferenceChunk>>> {
        use futures::StreamExt;

        let model = if model.trim().is_empty() {
            let loaded = self.loaded_models.read().await;
            let fallback = loaded
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no model specified and no preloaded models available"))?;
            tracing::warn!(fallback_model = %fallback, "empty model name, using fallback");
            fallback
        } else {
            model.to_string()
        };

        let actual_model = self.resolve_variant(&model).await?;

        let payload = serde_json::json!({
            "model": actual_model,
            "prompt": prompt,
            "stream": true,
            "options": options,
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.backend_url))
            .timeout(READ_TIMEOUT)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let byte_stream = response.bytes_stream();
        let chunk_stream = async_stream::try_stream! {
            let mut buf = String::new();
            futures::pin_mut!(byte_stream);
            while let Some(bytes) = byte_stream.next().await {
                let bytes = bytes?;
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].to_string();
                    buf.drain(..=pos);
                    if line.trim().is_empty() {
                        continue;
                    }
                    let Ok(raw) = serde_json::from_str::<Value>(&line) else {
                        tracing::warn!("failed to parse backend chunk as JSON, skipping");
                        continue;
                    };
                    let response = raw
                        .get("response")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let done = raw.get("done").and_then(Value::as_bool).unwrap_or(false);
                    let is_done = done;
                    yield InferenceChunk { response, done, raw };
                    if is_done {
                        break;
                    }
                }
            }
        };

        Ok(chunk_stream)
    }

    /// Resolves a requested model id to a concrete variant, ensuring it is
    /// loaded at the backend, re-running variant selection and emergency
    /// fallback as needed.
    async fn resolve_variant(&self, model: &str) -> anyhow::Result<String> {
        if let Some(existing) = self.model_registry.read().await.get(model).cloned() {
            if self.loaded_models.read().await.contains(&existing) {
                return Ok(existing);
            }
        }

        tracing::info!(model = %model, "model not preloaded, selecting optimal variant");
        let mut actual_model = self.select_optimal_model_variant(model).await?;

        if !self.can_load(&actual_model).await {
            tracing::warn!(variant = %actual_model, "insufficient memory, trying smaller quantization");
            // The memory-constrained search already failed inside
            // `select_optimal_model_variant`; re-running it with the same
            // budget would just repeat the same `None`. Search the full
            // backend listing unconstrained so a pre-existing smaller
            // variant can still win over a fresh emergency pull.
            if let Some(existing) = self
                .find_existing_quantized_model(model, UNCONSTRAINED_MEMORY_MB)
                .await?
            {
                actual_model = existing;
            } else {
                actual_model = quantization::build_variant_id(model, "Q2_K");
            }
        }

        self.ensure_pulled(&actual_model).await?;

        self.loaded_models.write().await.push(actual_model.clone());
        self.model_registry
            .write()
            .await
            .insert(model.to_string(), actual_model.clone());

        Ok(actual_model)
    }

    /// Thin wrapper over `/api/show`; used for diagnostics only.
    pub async fn get_model_info(&self, model: &str) -> Option<Value> {
        self.client
            .post(format!("{}/api/show", self.backend_url))
            .json(&serde_json::json!({ "name": model }))
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .json()
            .await
            .ok()
    }

    /// Thin wrapper over `/api/tags`, tolerant of backend errors.
    pub async fn list_models(&self) -> Vec<Value> {
        let result: anyhow::Result<Vec<Value>> = async {
            let body: Value = self
                .client
                .get(format!("{}/api/tags", self.backend_url))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok(body
                .get("models")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default())
        }
        .await;

        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to list models");
            Vec::new()
        })
    }

    pub async fn loaded_model_count(&self) -> usize {
        self.loaded_models.read().await.len()
    }

    pub async fn loaded_models_joined(&self) -> String {
        self.loaded_models.read().await.join(",")
    }

    /// Quantization recommendations for the current system: memory status,
    /// available formats by tier, and ARM-optimization flag.
    pub fn quantization_recommendations(&self) -> Value {
        let sample = self.telemetry.sample();
        let tier = quantization::tier_for(sample.free_ram_mb);
        let available = quantization::list_available(sample.free_ram_mb);

        let available_json: HashMap<&'static str, Vec<&'static str>> = available
            .into_iter()
            .map(|(tier, formats)| (tier.as_str(), formats))
            .collect();

        serde_json::json!({
            "system_memory": {
                "total_mb": sample.total_ram_mb,
                "available_mb": sample.free_ram_mb,
                "recommended_tier": tier.as_str(),
            },
            "available_quantizations": available_json,
            "is_arm_optimized": quantization::is_arm(),
        })
    }

    /// Composite report used by `GetStatus`: telemetry, registry contents,
    /// and the recommendation set.
    pub async fn system_status(&self) -> Value {
        let sample = self.telemetry.sample();
        let registry = self.model_registry.read().await;

        let mut model_info = Vec::new();
        for (base_model, actual_model) in registry.iter() {
            model_info.push(serde_json::json!({
                "base_model": base_model,
                "loaded_model": actual_model,
                "estimated_memory_mb": self.memory_usage_estimate_mb(actual_model),
            }));
        }

        let usage_percent = if sample.total_ram_mb > 0 {
            ((sample.total_ram_mb - sample.free_ram_mb) as f64 / sample.total_ram_mb as f64) * 100.0
        } else {
            0.0
        };

        serde_json::json!({
            "memory": {
                "total_mb": sample.total_ram_mb,
                "available_mb": sample.free_ram_mb,
                "usage_percent": usage_percent,
            },
            "loaded_models": model_info,
            "quantization": self.quantization_recommendations(),
            "system_info": {
                "is_arm": quantization::is_arm(),
                "loaded_model_count": self.loaded_models.read().await.len(),
            },
        })
    }

    pub fn memory_tier(&self) -> Tier {
        let sample = self.telemetry.sample();
        quantization::tier_for(sample.free_ram_mb)
    }
}

/// Measures wall-clock elapsed since `start`, in milliseconds. Used by the
/// coordinator client for `rtt_ms`.
pub fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> ModelManager {
        ModelManager::new("http://localhost:11434", Arc::new(TelemetryProbe::new()))
    }

    #[test]
    fn memory_usage_estimate_defaults_to_q4_k_m_when_untagged() {
        let manager = test_manager();
        let tagged = manager.memory_usage_estimate_mb("llama3.1:q4_k_m");
        let untagged = manager.memory_usage_estimate_mb("llama3.1");
        assert_eq!(tagged, untagged);
    }

    #[tokio::test]
    async fn fresh_manager_has_no_loaded_models() {
        let manager = test_manager();
        assert_eq!(manager.loaded_model_count().await, 0);
        assert_eq!(manager.loaded_models_joined().await, "");
    }

    #[test]
    fn quantization_recommendations_includes_arm_flag() {
        let manager = test_manager();
        let report = manager.quantization_recommendations();
        assert!(report.get("is_arm_optimized").is_some());
        assert!(report.get("system_memory").is_some());
    }
}

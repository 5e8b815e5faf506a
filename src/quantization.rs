//! GGUF quantization catalog: static format table, memory tiers, and the
//! selection rules used to pick a weight format for a given memory budget.

use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Emergency,
    Good,
    High,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Premium => "premium",
            Tier::High => "high",
            Tier::Good => "good",
            Tier::Emergency => "emergency",
        }
    }

    fn threshold_mb(&self) -> u64 {
        match self {
            Tier::Premium => 8192,
            Tier::High => 6144,
            Tier::Good => 4096,
            Tier::Emergency => 0,
        }
    }

    fn formats(&self) -> &'static [&'static str] {
        match self {
            Tier::Premium => &["Q8_0", "Q6_K_L", "Q6_K"],
            Tier::High => &["Q5_K_M", "Q4_K_M", "Q4_K_S"],
            Tier::Good => &["IQ4_XS", "Q3_K_L", "IQ3_M"],
            Tier::Emergency => &["Q2_K", "IQ2_M"],
        }
    }

    /// All tiers ordered from most to least demanding, matching the
    /// iteration order `determine_optimal_tier` relies on.
    fn ordered() -> &'static [Tier] {
        &[Tier::Premium, Tier::High, Tier::Good, Tier::Emergency]
    }
}

#[derive(Debug, Clone)]
pub struct QuantizationFormat {
    pub name: &'static str,
    pub memory_overhead_mb: u64,
    pub quality_score: f64,
    pub description: &'static str,
    pub arm_optimized: bool,
}

fn table() -> &'static HashMap<&'static str, QuantizationFormat> {
    static TABLE: OnceLock<HashMap<&'static str, QuantizationFormat>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let entries = [
            ("Q8_0", 512, 0.95, "8-bit quantization, near original quality", false),
            ("Q6_K_L", 384, 0.90, "6-bit mixed precision, large model", false),
            ("Q6_K", 320, 0.88, "6-bit mixed precision", false),
            ("Q5_K_M", 256, 0.85, "5-bit mixed precision, medium", false),
            ("Q4_K_M", 192, 0.80, "4-bit mixed precision, medium (default)", false),
            ("Q4_K_S", 160, 0.78, "4-bit mixed precision, small", false),
            ("IQ4_XS", 128, 0.75, "4-bit improved quantization, extra small", false),
            ("Q3_K_L", 112, 0.70, "3-bit mixed precision, large", false),
            ("IQ3_M", 96, 0.68, "3-bit improved quantization, medium", false),
            ("Q2_K", 64, 0.60, "2-bit quantization, minimal quality", false),
            ("IQ2_M", 48, 0.55, "2-bit improved quantization, minimal", false),
            ("Q4_0_4_4", 144, 0.76, "4-bit ARM optimization", true),
            ("Q4_0_8_8", 160, 0.78, "4-bit ARM optimization, larger", true),
        ];
        entries
            .into_iter()
            .map(|(name, overhead, quality, desc, arm)| {
                (
                    name,
                    QuantizationFormat {
                        name,
                        memory_overhead_mb: overhead,
                        quality_score: quality,
                        description: desc,
                        arm_optimized: arm,
                    },
                )
            })
            .collect()
    })
}

/// Returns true if this process is running on an ARM host, cached for the
/// process lifetime.
pub fn is_arm() -> bool {
    static IS_ARM: OnceLock<bool> = OnceLock::new();
    *IS_ARM.get_or_init(|| {
        let arch = std::env::consts::ARCH.to_lowercase();
        arch.contains("arm") || arch.contains("aarch64")
    })
}

/// Returns the quantization tier for a given amount of free RAM, in MB.
pub fn tier_for(free_mb: u64) -> Tier {
    for tier in Tier::ordered() {
        if free_mb >= tier.threshold_mb() {
            return *tier;
        }
    }
    Tier::Emergency
}

fn candidate_formats(tier: Tier) -> Vec<&'static str> {
    let mut formats: Vec<&'static str> = tier.formats().to_vec();
    if is_arm() && matches!(tier, Tier::High | Tier::Good) {
        formats.push("Q4_0_4_4");
        formats.push("Q4_0_8_8");
    }
    formats
}

/// Direct lookup by format name, case-insensitive.
pub fn quantization_info(name: &str) -> Option<&'static QuantizationFormat> {
    table().get(name.to_uppercase().as_str())
}

/// True if any catalog format name appears anywhere in `model_id`
/// (case-insensitive) — used to detect a model id that already carries an
/// explicit quantization tag, matching the original substring check.
pub fn contains_known_format(model_id: &str) -> bool {
    let upper = model_id.to_uppercase();
    table().keys().any(|name| upper.contains(name))
}

/// Picks the highest-quality format in the tier for `free_mb`, breaking ties
/// by lower memory overhead. Adds the ARM-optimized formats to the candidate
/// list first when the host is ARM and the tier is HIGH or GOOD.
pub fn recommended(free_mb: u64, prefer_quality: bool) -> &'static str {
    let tier = tier_for(free_mb);
    let mut formats = candidate_formats(tier);
    let info = |n: &&str| table().get(*n).expect("catalog entry must exist");

    if prefer_quality {
        formats.sort_by(|a, b| {
            let a = info(a);
            let b = info(b);
            b.quality_score
                .partial_cmp(&a.quality_score)
                .unwrap()
                .then(a.memory_overhead_mb.cmp(&b.memory_overhead_mb))
        });
    } else {
        formats.sort_by(|a, b| info(a).memory_overhead_mb.cmp(&info(b).memory_overhead_mb));
    }

    formats[0]
}

/// Every tier at or below the current tier (EMERGENCY always included), with
/// ARM formats appended where applicable. Mirrors
/// `GGUFQuantizationManager.list_available_quantizations`.
pub fn list_available(free_mb: u64) -> HashMap<Tier, Vec<&'static str>> {
    let current = tier_for(free_mb);
    let mut out = HashMap::new();
    for tier in Tier::ordered() {
        if *tier <= current || *tier == Tier::Emergency {
            out.insert(*tier, candidate_formats(*tier));
        }
    }
    out
}

/// Deterministic construction of the backend-visible model identifier.
pub fn build_variant_id(base_model: &str, format: &str) -> String {
    if let Some((base, _)) = base_model.split_once(':') {
        format!("{base}:{}", format.to_lowercase())
    } else if base_model.ends_with("-GGUF") {
        format!("{base_model}:{format}")
    } else {
        format!("{base_model}:{}", format.to_lowercase())
    }
}

/// Builds a variant name, selecting a format automatically when none is
/// given.
pub fn build_variant_id_auto(base_model: &str, free_mb: u64) -> String {
    let format = recommended(free_mb, true);
    build_variant_id(base_model, format)
}

/// Rough size heuristic from the base model's name, defaulting to 4096 MB.
fn base_model_size_mb(model_name: &str) -> u64 {
    let lower = model_name.to_lowercase();
    if lower.contains("1b") {
        2048
    } else if lower.contains("7b") {
        6144
    } else if lower.contains("13b") {
        10240
    } else {
        4096
    }
}

/// Estimates total memory usage for a quantized model: size heuristic scaled
/// by the inverse of quality, plus the format's fixed overhead.
pub fn estimate_memory(model_name: &str, format: &str) -> u64 {
    let Some(info) = quantization_info(format) else {
        return 4096;
    };
    let base = base_model_size_mb(model_name) as f64;
    let quantized = (base * (1.0 - info.quality_score + 0.2)) as u64;
    quantized + info.memory_overhead_mb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_thresholds_match_catalog() {
        assert_eq!(tier_for(8192), Tier::Premium);
        assert_eq!(tier_for(8191), Tier::High);
        assert_eq!(tier_for(6144), Tier::High);
        assert_eq!(tier_for(6000), Tier::Good);
        assert_eq!(tier_for(4096), Tier::Good);
        assert_eq!(tier_for(100), Tier::Emergency);
        assert_eq!(tier_for(0), Tier::Emergency);
    }

    #[test]
    fn tier_for_is_monotonic() {
        let samples = [0u64, 100, 2048, 4096, 4097, 6144, 6200, 8192, 20000];
        for w in samples.windows(2) {
            assert!(tier_for(w[1]) >= tier_for(w[0]));
        }
    }

    #[test]
    fn recommended_picks_highest_quality_in_tier() {
        assert_eq!(recommended(8192, true), "Q8_0");
        assert_eq!(recommended(6144, true), "Q5_K_M");
        assert_eq!(recommended(4096, true), "IQ4_XS");
        assert_eq!(recommended(100, true), "Q2_K");
    }

    #[test]
    fn build_variant_id_replaces_existing_tag() {
        assert_eq!(
            build_variant_id("llama3.1:8b-instruct", "Q4_K_M"),
            "llama3.1:q4_k_m"
        );
    }

    #[test]
    fn build_variant_id_appends_when_no_tag() {
        assert_eq!(build_variant_id("llama3.1", "Q4_K_M"), "llama3.1:q4_k_m");
    }

    #[test]
    fn build_variant_id_roundtrips_format() {
        for format in ["Q8_0", "Q4_K_M", "IQ3_M", "Q2_K"] {
            let variant = build_variant_id("llama3.1", format);
            let parsed = variant.rsplit(':').next().unwrap().to_uppercase();
            assert_eq!(parsed, format);
        }
    }

    #[test]
    fn estimate_memory_unknown_format_uses_conservative_default() {
        assert_eq!(estimate_memory("llama3.1:8b", "NOT_A_FORMAT"), 4096);
    }

    #[test]
    fn estimate_memory_scales_with_model_size_hint() {
        let small = estimate_memory("llama-1b", "Q4_K_M");
        let large = estimate_memory("llama-13b", "Q4_K_M");
        assert!(large > small);
    }

    #[test]
    fn quantization_info_is_case_insensitive() {
        assert!(quantization_info("q4_k_m").is_some());
        assert!(quantization_info("Q4_K_M").is_some());
        assert!(quantization_info("bogus").is_none());
    }

    #[test]
    fn contains_known_format_detects_suffix_anywhere() {
        assert!(contains_known_format("llama3.1:8b-instruct-q4_k_m"));
        assert!(!contains_known_format("llama3.1:8b-instruct"));
    }

    #[test]
    fn list_available_always_includes_emergency() {
        let available = list_available(8192);
        assert!(available.contains_key(&Tier::Emergency));
        assert!(available.contains_key(&Tier::Premium));
    }
}

//! Pipeline configuration.
//!
//! Everything here has a default tuned for interactive chat; a TOML file can
//! override any subset. Parsing is strict: unknown keys are rejected so a
//! typo fails loudly at load time instead of silently using a default.

use serde::{Deserialize, Serialize};

use chatflow_types::UserTier;

/// Flush tuning for one output channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    /// Pending size (bytes) at which the buffer flushes unconditionally.
    #[serde(default = "default_buffer_threshold")]
    pub threshold: usize,
    /// Markers that trigger a flush cut at their last occurrence.
    #[serde(default)]
    pub break_markers: Vec<String>,
}

impl BufferConfig {
    #[must_use]
    pub fn new(threshold: usize, break_markers: Vec<String>) -> Self {
        Self {
            threshold,
            break_markers,
        }
    }
}

/// Admission settings for the sandbox resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Successful runs allowed per user per UTC day.
    #[serde(default = "default_sandbox_daily_limit")]
    pub daily_limit: u32,
    /// Minimum subscription tier.
    #[serde(default = "default_sandbox_tier")]
    pub required_tier: UserTier,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_sandbox_daily_limit(),
            required_tier: default_sandbox_tier(),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Reasoning-channel buffer: paragraph-sized flushes.
    #[serde(default = "default_reasoning_buffer")]
    pub reasoning_buffer: BufferConfig,
    /// Answer-channel buffer: line-sized flushes.
    #[serde(default = "default_answer_buffer")]
    pub answer_buffer: BufferConfig,
    /// TTL for deduplicated tool results, in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Cap on accumulated tool-call argument bytes per call.
    #[serde(default = "default_max_tool_args_bytes")]
    pub max_tool_args_bytes: usize,
    /// Whether to re-synthesize an answer when tools succeed but the model
    /// streams no answer text.
    #[serde(default = "default_fallback_enabled")]
    pub fallback_enabled: bool,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reasoning_buffer: default_reasoning_buffer(),
            answer_buffer: default_answer_buffer(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_tool_args_bytes: default_max_tool_args_bytes(),
            fallback_enabled: default_fallback_enabled(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document, filling omitted fields with defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, crate::errors::EngineError> {
        Ok(toml::from_str(raw)?)
    }
}

fn default_buffer_threshold() -> usize {
    200
}

// Reasoning narration reads best in paragraphs; answers in lines.
fn default_reasoning_buffer() -> BufferConfig {
    BufferConfig::new(200, vec!["\n\n".to_string()])
}

fn default_answer_buffer() -> BufferConfig {
    BufferConfig::new(200, vec!["\n".to_string()])
}

fn default_cache_ttl_secs() -> u64 {
    5 * 60
}

fn default_max_tool_args_bytes() -> usize {
    256 * 1024
}

fn default_fallback_enabled() -> bool {
    true
}

fn default_sandbox_daily_limit() -> u32 {
    2
}

fn default_sandbox_tier() -> UserTier {
    UserTier::Plus
}

#[cfg(test)]
mod tests {
    use chatflow_types::UserTier;

    use super::PipelineConfig;

    #[test]
    fn defaults_cover_an_empty_document() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config.reasoning_buffer.threshold, 200);
        assert_eq!(config.reasoning_buffer.break_markers, vec!["\n\n"]);
        assert_eq!(config.answer_buffer.break_markers, vec!["\n"]);
        assert_eq!(config.cache_ttl_secs, 300);
        assert_eq!(config.sandbox.daily_limit, 2);
        assert_eq!(config.sandbox.required_tier, UserTier::Plus);
        assert!(config.fallback_enabled);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let raw = r#"
            cache_ttl_secs = 60

            [sandbox]
            daily_limit = 5
        "#;
        let config = PipelineConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.cache_ttl_secs, 60);
        assert_eq!(config.sandbox.daily_limit, 5);
        assert_eq!(config.sandbox.required_tier, UserTier::Plus);
        assert_eq!(config.answer_buffer.threshold, 200);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PipelineConfig::from_toml_str("cache_ttl_seconds = 60").is_err());
    }
}

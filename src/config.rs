use std::fmt;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::error::ConfigError;
use crate::sampler::{SamplerOptions, DEFAULT_BASE_INTERVAL_SECONDS, DEFAULT_MAX_FRAMES};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Provider {
    /// Native Gemini API, supports search grounding.
    #[default]
    Gemini,
    /// Any OpenAI-compatible chat completions endpoint.
    Openai,
}

#[derive(Clone)]
pub struct AnalyzerConfig {
    pub api_key: Option<String>,
    pub provider: Provider,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub max_output_tokens: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: Provider::default(),
            model: DEFAULT_MODEL.to_owned(),
            base_url: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

impl fmt::Debug for AnalyzerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzerConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

impl AnalyzerConfig {
    pub fn credential(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingCredential)
    }
}

/// Command line and environment settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// API key for the model provider (falls back to API_KEY)
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "VIDSPEC_PROVIDER", value_enum, default_value_t = Provider::Gemini, global = true)]
    pub provider: Provider,

    #[arg(long, env = "VIDSPEC_MODEL", default_value = DEFAULT_MODEL, global = true)]
    pub model: String,

    /// Override the provider's API base URL
    #[arg(long, env = "VIDSPEC_BASE_URL", global = true)]
    pub base_url: Option<String>,

    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, global = true)]
    pub timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_TOKENS, global = true)]
    pub max_output_tokens: u32,

    /// Upper bound on frames sent to the model
    #[arg(long, default_value_t = DEFAULT_MAX_FRAMES, global = true)]
    pub max_frames: usize,

    /// Preferred spacing between captured frames, in seconds
    #[arg(long, default_value_t = DEFAULT_BASE_INTERVAL_SECONDS, global = true)]
    pub interval: f64,
}

impl Settings {
    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            api_key: self
                .api_key
                .clone()
                .or_else(|| std::env::var("API_KEY").ok()),
            provider: self.provider,
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            max_output_tokens: self.max_output_tokens,
        }
    }

    pub fn sampler_options(&self) -> Result<SamplerOptions, ConfigError> {
        let options = SamplerOptions {
            max_frames: self.max_frames,
            base_interval_seconds: self.interval,
        };
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        settings: Settings,
    }

    #[test]
    fn defaults_match_the_capture_budget() {
        let cli = TestCli::parse_from(["vidspec", "--api-key", "k"]);
        let options = cli.settings.sampler_options().unwrap();
        assert_eq!(options.max_frames, 15);
        assert_eq!(options.base_interval_seconds, 2.0);

        let config = cli.settings.analyzer_config();
        assert_eq!(config.credential().unwrap(), "k");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.timeout, Duration::from_secs(300));
    }

    #[test]
    fn zero_frame_budget_is_rejected() {
        let cli = TestCli::parse_from(["vidspec", "--max-frames", "0"]);
        assert!(cli.settings.sampler_options().is_err());
    }

    #[test]
    fn debug_output_hides_the_key() {
        let config = AnalyzerConfig {
            api_key: Some("secret-key".into()),
            ..AnalyzerConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn provider_is_selectable() {
        let cli = TestCli::parse_from(["vidspec", "--provider", "openai", "--base-url", "http://localhost:1234/v1"]);
        let config = cli.settings.analyzer_config();
        assert_eq!(config.provider, Provider::Openai);
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:1234/v1"));
    }
}

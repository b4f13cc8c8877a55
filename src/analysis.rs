use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::ai::{GenerativeModel, InlineImage, ModelError, ModelRequest, OpenAiModel};
use crate::config::{AnalyzerConfig, Provider};
use crate::error::{AnalysisError, ConfigError};
use crate::gemini::GeminiModel;
use crate::sampler::Frame;
use crate::template;

/// A web page the model reports having consulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Generated Markdown specification plus the sources behind it. `sources` is
/// only ever non-empty for URL analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub prompt: String,
    pub sources: Vec<Citation>,
}

#[derive(Debug, Clone)]
pub enum AnalysisRequest {
    Frames(Vec<Frame>),
    VideoUrl(String),
    Refine {
        original_prompt: String,
        feedback: String,
    },
}

/// Turns frames, URLs and feedback into requests for the model and
/// normalizes what comes back.
pub struct Analyzer {
    model: Box<dyn GenerativeModel>,
    timeout: Duration,
}

impl Analyzer {
    /// Build the configured backend. Fails when no API key is available.
    pub fn new(config: &AnalyzerConfig) -> Result<Self, ConfigError> {
        let api_key = config.credential()?;
        let model: Box<dyn GenerativeModel> = match config.provider {
            Provider::Gemini => {
                let mut model = GeminiModel::new(api_key, &config.model, config.max_output_tokens);
                if let Some(base_url) = &config.base_url {
                    model = model.with_base_url(base_url);
                }
                Box::new(model)
            }
            Provider::Openai => Box::new(OpenAiModel::new(
                api_key,
                config.base_url.as_deref(),
                &config.model,
                config.max_output_tokens,
            )),
        };
        info!(backend = model.name(), model = %config.model, "analyzer ready");
        Ok(Self::with_model(model, config.timeout))
    }

    pub fn with_model(model: Box<dyn GenerativeModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        match request {
            AnalysisRequest::Frames(frames) => self.analyze_frames(&frames).await,
            AnalysisRequest::VideoUrl(url) => self.analyze_video_url(&url).await,
            AnalysisRequest::Refine {
                original_prompt,
                feedback,
            } => self.refine(&original_prompt, &feedback).await,
        }
    }

    pub async fn analyze_frames(&self, frames: &[Frame]) -> Result<AnalysisResult, AnalysisError> {
        if frames.is_empty() {
            return Err(AnalysisError::Failed("there are no frames to analyze".into()));
        }
        info!(frames = frames.len(), "analyzing video frames");
        let request = ModelRequest {
            instruction: template::frames_instruction(),
            images: frames
                .iter()
                .map(|frame| InlineImage {
                    mime_type: frame.mime_type().to_owned(),
                    data: frame.to_base64(),
                })
                .collect(),
            search: false,
        };
        let response = self.send(request).await?;
        Ok(AnalysisResult {
            prompt: response.text,
            sources: Vec::new(),
        })
    }

    pub async fn analyze_video_url(&self, url: &str) -> Result<AnalysisResult, AnalysisError> {
        let url = Url::parse(url.trim())
            .map_err(|err| AnalysisError::Failed(format!("invalid video URL {url:?}: {err}")))?;
        info!(%url, "analyzing video by URL");
        let request = ModelRequest {
            instruction: template::video_url_instruction(url.as_str()),
            images: Vec::new(),
            search: true,
        };
        let response = self.send(request).await?;

        let mut sources: Vec<Citation> = Vec::with_capacity(response.citations.len());
        for citation in response.citations {
            if !sources.iter().any(|seen| seen.uri == citation.uri) {
                sources.push(citation);
            }
        }
        Ok(AnalysisResult {
            prompt: response.text,
            sources,
        })
    }

    pub async fn refine(
        &self,
        original_prompt: &str,
        feedback: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        info!("refining generated prompt");
        let request = ModelRequest {
            instruction: template::refine_instruction(original_prompt, feedback),
            images: Vec::new(),
            search: false,
        };
        let response = self.send(request).await?;
        Ok(AnalysisResult {
            prompt: response.text,
            sources: Vec::new(),
        })
    }

    /// One attempt, bounded by the configured timeout. No retries.
    async fn send(&self, request: ModelRequest) -> Result<crate::ai::ModelResponse, AnalysisError> {
        let response = tokio::time::timeout(self.timeout, self.model.generate(request))
            .await
            .map_err(|_| {
                error!(timeout = ?self.timeout, "model call timed out");
                AnalysisError::Failed(format!("no response within {} seconds", self.timeout.as_secs()))
            })?
            .map_err(|err| {
                error!(%err, backend = self.model.name(), "model call failed");
                match err {
                    ModelError::Unauthorized(message) => AnalysisError::InvalidCredential(message),
                    other => AnalysisError::Failed(other.to_string()),
                }
            })?;

        if !template::has_expected_structure(&response.text) {
            warn!("model reply is missing some of the expected section headings");
        }
        Ok(response)
    }
}

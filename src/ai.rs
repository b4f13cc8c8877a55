use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ImageUrlArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::analysis::Citation;

/// A base64 image attached to a model request.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

impl InlineImage {
    fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRequest {
    pub instruction: String,
    pub images: Vec<InlineImage>,
    /// Ask the service to ground its answer with a web search.
    pub search: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Api(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("the model returned no text")]
    EmptyResponse,
}

/// A remote text generation service.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Any OpenAI-compatible chat completions endpoint, Gemini's included.
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
}

impl OpenAiModel {
    pub fn new(api_key: &str, base_url: Option<&str>, model: &str, max_tokens: u32) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = base_url {
            config = config.with_api_base(base_url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_owned(),
            max_tokens,
        }
    }

    fn chat_request(&self, request: ModelRequest) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_tokens(self.max_tokens)
            .messages([ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ChatCompletionRequestUserMessageContent::Array(
                        [
                            vec![ChatCompletionRequestUserMessageContentPart::Text(
                                ChatCompletionRequestMessageContentPartTextArgs::default()
                                    .text(request.instruction)
                                    .build()?,
                            )],
                            request
                                .images
                                .iter()
                                .map(|image| -> Result<_, OpenAIError> {
                                    Ok(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                                        ChatCompletionRequestMessageContentPartImageArgs::default()
                                            .image_url(
                                                ImageUrlArgs::default().url(image.data_url()).build()?,
                                            )
                                            .build()?,
                                    ))
                                })
                                .collect::<Result<_, _>>()?,
                        ]
                        .concat(),
                    ))
                    .build()?,
            )])
            .build()?;
        Ok(request)
    }
}

#[async_trait]
impl GenerativeModel for OpenAiModel {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        if request.search {
            warn!("web search grounding is not available through the OpenAI-compatible API, sending the request without it");
        }
        let image_count = request.images.len();
        let chat_request = self.chat_request(request).map_err(classify)?;

        debug!(model = %self.model, images = image_count, "sending chat completion request");
        let response = self.client.chat().create(chat_request).await.map_err(classify)?;
        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)?;

        Ok(ModelResponse {
            text,
            citations: Vec::new(),
        })
    }
}

fn classify(err: OpenAIError) -> ModelError {
    match err {
        OpenAIError::ApiError(api) => {
            let details = format!("{api:?}");
            if details.contains("invalid_api_key")
                || details.contains("API_KEY_INVALID")
                || details.contains("Incorrect API key")
            {
                ModelError::Unauthorized(api.message)
            } else {
                ModelError::Api(api.message)
            }
        }
        OpenAIError::Reqwest(err) => ModelError::Transport(err.to_string()),
        other => ModelError::Api(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use async_openai::error::ApiError;

    use super::*;

    fn api_error(message: &str, code: &str) -> OpenAIError {
        serde_json::from_value::<ApiError>(serde_json::json!({
            "message": message,
            "type": "invalid_request_error",
            "param": null,
            "code": code,
        }))
        .map(OpenAIError::ApiError)
        .unwrap()
    }

    #[test]
    fn invalid_key_is_reported_as_unauthorized() {
        let err = classify(api_error("Incorrect API key provided", "invalid_api_key"));
        assert!(matches!(err, ModelError::Unauthorized(_)));
    }

    #[test]
    fn other_api_errors_stay_generic() {
        let err = classify(api_error("You exceeded your current quota", "insufficient_quota"));
        assert!(matches!(err, ModelError::Api(message) if message.contains("quota")));
    }

    #[test]
    fn request_carries_instruction_then_images() {
        let model = OpenAiModel::new("key", None, "gemini-2.5-flash", 1024);
        let request = model
            .chat_request(ModelRequest {
                instruction: "describe".into(),
                images: vec![InlineImage {
                    mime_type: "image/jpeg".into(),
                    data: "AAAA".into(),
                }],
                search: false,
            })
            .unwrap();

        let json = serde_json::to_value(&request).unwrap();
        let parts = &json["messages"][0]["content"];
        assert_eq!(parts[0]["text"], "describe");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,AAAA");
        assert_eq!(json["model"], "gemini-2.5-flash");
    }
}

//! Native Gemini `generateContent` client. Unlike the OpenAI-compatible
//! endpoint it supports Google Search grounding and returns the sources the
//! model consulted.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ai::{GenerativeModel, ModelError, ModelRequest, ModelResponse};
use crate::analysis::Citation;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiModel {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    max_output_tokens: u32,
}

impl GeminiModel {
    pub fn new(api_key: &str, model: &str, max_output_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            model: model.to_owned(),
            api_key: api_key.to_owned(),
            max_output_tokens,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_owned();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Part {
    Text(String),
    InlineData {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Debug, Serialize)]
struct GoogleSearch {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    uri: Option<String>,
    title: Option<String>,
}

fn build_request(request: ModelRequest, max_output_tokens: u32) -> GenerateContentRequest {
    let mut parts = vec![Part::Text(request.instruction)];
    parts.extend(request.images.into_iter().map(|image| Part::InlineData {
        mime_type: image.mime_type,
        data: image.data,
    }));

    let tools = if request.search {
        vec![Tool {
            google_search: GoogleSearch {},
        }]
    } else {
        Vec::new()
    };

    GenerateContentRequest {
        contents: vec![Content {
            role: "user",
            parts,
        }],
        tools,
        generation_config: GenerationConfig { max_output_tokens },
    }
}

fn into_model_response(response: GenerateContentResponse) -> Result<ModelResponse, ModelError> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or(ModelError::EmptyResponse)?;

    let text: String = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ModelError::EmptyResponse);
    }

    let citations = candidate
        .grounding_metadata
        .map(|metadata| {
            metadata
                .grounding_chunks
                .into_iter()
                .filter_map(|chunk| chunk.web)
                .filter_map(|web| {
                    web.uri.map(|uri| Citation {
                        uri,
                        title: web.title,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ModelResponse { text, citations })
}

/// Map a failed HTTP exchange onto a model error, singling out bad credentials.
fn classify_failure(status: StatusCode, body: &str) -> ModelError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| json["error"]["message"].as_str().map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_owned());
    let message = format!("{status}: {message}");

    if status == StatusCode::UNAUTHORIZED
        || body.contains("API_KEY_INVALID")
        || body.contains("UNAUTHENTICATED")
    {
        ModelError::Unauthorized(message)
    } else {
        ModelError::Api(message)
    }
}

#[async_trait]
impl GenerativeModel for GeminiModel {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let search = request.search;
        let images = request.images.len();
        let body = build_request(request, self.max_output_tokens);

        debug!(model = %self.model, images, search, "sending generateContent request");
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ModelError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|err| ModelError::Api(format!("malformed response: {err}")))?;
        into_model_response(parsed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ai::InlineImage;

    #[test]
    fn images_follow_the_instruction_as_inline_data() {
        let request = build_request(
            ModelRequest {
                instruction: "analyze".into(),
                images: vec![InlineImage {
                    mime_type: "image/jpeg".into(),
                    data: "QUJD".into(),
                }],
                search: false,
            },
            2048,
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({
                "contents": [{
                    "role": "user",
                    "parts": [
                        {"text": "analyze"},
                        {"inlineData": {"mimeType": "image/jpeg", "data": "QUJD"}}
                    ]
                }],
                "generationConfig": {"maxOutputTokens": 2048}
            })
        );
    }

    #[test]
    fn search_requests_enable_the_google_search_tool() {
        let request = build_request(
            ModelRequest {
                instruction: "look it up".into(),
                images: Vec::new(),
                search: true,
            },
            1024,
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["tools"], json!([{"googleSearch": {}}]));
    }

    #[test]
    fn text_and_grounding_sources_are_extracted() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"parts": [{"text": "### 1. App Overview\n"}, {"text": "A planner."}]},
                "groundingMetadata": {
                    "groundingChunks": [
                        {"web": {"uri": "https://youtube.com/watch?v=1", "title": "Demo"}},
                        {"web": {"uri": "https://example.com"}},
                        {"retrievedContext": {"uri": "ignored"}}
                    ]
                }
            }]
        }))
        .unwrap();

        let result = into_model_response(response).unwrap();
        assert_eq!(result.text, "### 1. App Overview\nA planner.");
        assert_eq!(
            result.citations,
            vec![
                Citation {
                    uri: "https://youtube.com/watch?v=1".into(),
                    title: Some("Demo".into()),
                },
                Citation {
                    uri: "https://example.com".into(),
                    title: None,
                },
            ]
        );
    }

    #[test]
    fn missing_candidates_are_an_empty_response() {
        let result = into_model_response(GenerateContentResponse::default());
        assert!(matches!(result, Err(ModelError::EmptyResponse)));
    }

    #[test]
    fn invalid_api_key_is_unauthorized() {
        let body = json!({
            "error": {
                "code": 400,
                "message": "API key not valid. Please pass a valid API key.",
                "status": "INVALID_ARGUMENT",
                "details": [{"reason": "API_KEY_INVALID"}]
            }
        })
        .to_string();
        let err = classify_failure(StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, ModelError::Unauthorized(message) if message.contains("API key not valid")));
    }

    #[test]
    fn quota_errors_are_generic() {
        let body = r#"{"error": {"code": 429, "message": "Resource exhausted", "status": "RESOURCE_EXHAUSTED"}}"#;
        let err = classify_failure(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(matches!(err, ModelError::Api(message) if message.contains("Resource exhausted")));
    }

    #[test]
    fn endpoint_includes_the_model_name() {
        let model = GeminiModel::new("key", "gemini-2.5-flash", 1024).with_base_url("http://localhost:8080/v1beta/");
        assert_eq!(
            model.endpoint(),
            "http://localhost:8080/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }
}

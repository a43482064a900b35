//! Passport-field extraction through an OpenAI-compatible multimodal endpoint.
//!
//! We default to Google's OpenAI-compatible Gemini endpoint, but any server
//! speaking the `/chat/completions` protocol with image support works. The
//! response is constrained to a JSON Schema derived from [`PassportFields`].

use async_openai::{Client, config::OpenAIConfig, types::CreateChatCompletionResponse};
use async_trait::async_trait;
use base64::{Engine as _, prelude::BASE64_STANDARD};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::fs;

use crate::{
    prelude::*,
    retry::{ErrorKind, IsKnownTransient as _, UnitError, kind_for_status},
};

/// Google's OpenAI-compatible endpoint for Gemini models.
const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

const SYSTEM_MESSAGE: &str = "You are a helpful assistant that can extract text from images.";

const EXTRACTION_PROMPT: &str = "\
Please extract the name, passport number, and nationality from the provided \
passport image. Name must be in Last Name First Name order. If a field is \
not visible in the image, return it as an empty string.";

/// The structured fields we extract from each passport image.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PassportFields {
    /// The holder's last name.
    pub last_name: String,

    /// The holder's first name.
    pub first_name: String,

    /// The passport number.
    pub passport_number: String,

    /// The holder's nationality.
    pub nationality: String,
}

impl PassportFields {
    /// Check that every required field is actually filled in. A response
    /// that is well-formed but empty won't get better on retry.
    fn check_complete(&self) -> Result<(), UnitError> {
        let missing = [
            ("last_name", &self.last_name),
            ("first_name", &self.first_name),
            ("passport_number", &self.passport_number),
            ("nationality", &self.nationality),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(UnitError::new(
                ErrorKind::InvalidInput,
                format!("OCR response is missing required fields: {}", missing.join(", ")),
            ))
        }
    }
}

/// Capability interface for the OCR model call.
#[async_trait]
pub trait OcrClient: Send + Sync {
    /// Extract passport fields from one image.
    async fn extract(&self, image_path: &Path) -> Result<PassportFields, UnitError>;
}

/// An [`OcrClient`] backed by an OpenAI-compatible chat endpoint.
pub struct LlmOcrClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl LlmOcrClient {
    pub fn new(api_key: &str, api_base: Option<&str>, model: String) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base.unwrap_or(DEFAULT_API_BASE));
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    /// Load an image and encode it as a `data:` URL.
    ///
    /// Some sources indicate that the Base64 data should be percent-encoded,
    /// but in practice this breaks Gemini and probably several other LLMs.
    async fn image_data_url(image_path: &Path) -> Result<String, UnitError> {
        let mime = mime_guess::from_path(image_path).first_or_octet_stream();
        let data = fs::read(image_path).await.map_err(|err| {
            UnitError::new(
                ErrorKind::InvalidInput,
                format!("failed to read image {}: {err}", image_path.display()),
            )
        })?;
        Ok(format!(
            "data:{};base64,{}",
            mime.essence_str(),
            BASE64_STANDARD.encode(&data)
        ))
    }
}

#[async_trait]
impl OcrClient for LlmOcrClient {
    #[instrument(level = "debug", skip(self), fields(image = %image_path.display()))]
    async fn extract(&self, image_path: &Path) -> Result<PassportFields, UnitError> {
        let data_url = Self::image_data_url(image_path).await?;

        let request = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_MESSAGE },
                { "role": "user", "content": [
                    { "type": "text", "text": EXTRACTION_PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ] },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "PassportFields",
                    "strict": true,
                    "schema": response_schema(),
                },
            },
        });

        let response: Value = self
            .client
            .chat()
            .create_byot(request)
            .await
            .map_err(classify_api_error)?;
        debug!(%response, "OCR endpoint response");

        let response =
            serde_json::from_value::<CreateChatCompletionResponse>(response).map_err(|err| {
                UnitError::new(
                    ErrorKind::TransientModel,
                    format!("unexpected response shape from OCR endpoint: {err}"),
                )
            })?;

        let choice = response.choices.first().ok_or_else(|| {
            UnitError::new(ErrorKind::TransientModel, "OCR endpoint returned no choices")
        })?;
        if choice.finish_reason == Some(async_openai::types::FinishReason::ContentFilter) {
            return Err(UnitError::new(
                ErrorKind::InvalidInput,
                "content filter triggered by the OCR endpoint",
            ));
        }
        let content = choice.message.content.as_deref().unwrap_or_default();
        parse_fields(content)
    }
}

/// The JSON Schema the model's response must follow.
fn response_schema() -> Value {
    serde_json::to_value(schema_for!(PassportFields)).expect("schema serialization cannot fail")
}

/// Parse and validate the model's response content.
///
/// Non-JSON output is a transient model glitch worth retrying; JSON output
/// that lacks required fields is a terminal validation failure.
fn parse_fields(content: &str) -> Result<PassportFields, UnitError> {
    let value = serde_json::from_str::<Value>(content).map_err(|_| {
        UnitError::new(
            ErrorKind::TransientModel,
            "model returned output that is not valid JSON",
        )
    })?;
    let fields = serde_json::from_value::<PassportFields>(value).map_err(|err| {
        UnitError::new(
            ErrorKind::InvalidInput,
            format!("model response does not match the extraction schema: {err}"),
        )
    })?;
    fields.check_complete()?;
    Ok(fields)
}

/// Classify an API error into our retry taxonomy.
fn classify_api_error(err: async_openai::error::OpenAIError) -> UnitError {
    use async_openai::error::OpenAIError;
    match err {
        OpenAIError::Reqwest(err) => {
            let kind = if let Some(status) = err.status() {
                kind_for_status(status)
            } else if err.is_known_transient() {
                ErrorKind::TransientNetwork
            } else {
                ErrorKind::InvalidInput
            };
            UnitError::new(kind, format!("OCR request failed: {err}"))
        }
        OpenAIError::ApiError(err) => {
            // The OpenAI-compatible layer parses error bodies but drops the
            // HTTP status, so we classify from the error code instead.
            let code = err
                .code
                .as_ref()
                .map(|code| code.to_string())
                .unwrap_or_default();
            let kind = if code.contains("rate_limit") || code.contains("RESOURCE_EXHAUSTED") {
                ErrorKind::RateLimit
            } else if code.contains("unavailable")
                || code.contains("overloaded")
                || code.contains("internal")
            {
                ErrorKind::TransientNetwork
            } else {
                ErrorKind::InvalidInput
            };
            UnitError::new(kind, format!("OCR endpoint error: {}", err.message))
        }
        OpenAIError::JSONDeserialize(err) => UnitError::new(
            ErrorKind::TransientModel,
            format!("failed to parse OCR endpoint response: {err}"),
        ),
        other => UnitError::new(ErrorKind::InvalidInput, format!("OCR request failed: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fields_accepts_complete_response() {
        let content = r#"{
            "last_name": "DOE",
            "first_name": "JANE",
            "passport_number": "AB123456",
            "nationality": "UTOPIAN"
        }"#;
        let fields = parse_fields(content).unwrap();
        assert_eq!(fields.last_name, "DOE");
        assert_eq!(fields.passport_number, "AB123456");
    }

    #[test]
    fn non_json_output_is_transient() {
        let err = parse_fields("Sorry, I can't read this image.").unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransientModel);
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_fields_are_terminal() {
        let err = parse_fields(r#"{"last_name": "DOE"}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_fields_are_terminal() {
        let content = r#"{
            "last_name": "DOE",
            "first_name": "",
            "passport_number": "AB123456",
            "nationality": "UTOPIAN"
        }"#;
        let err = parse_fields(content).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(err.message.contains("first_name"));
    }

    #[test]
    fn response_schema_requires_every_field() {
        let schema = response_schema();
        let required = schema["required"]
            .as_array()
            .expect("schema should have required fields");
        assert_eq!(required.len(), 4);
    }
}

//! Vision model adapter.
//!
//! `VisionModel` is the seam the classifier calls through. `RigVision` bridges
//! any rig `CompletionModel` to it and forces a single tool call whose input
//! schema is the extraction schema, so the reply is always a JSON object.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rig::OneOrMany;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, ToolDefinition};
use rig::message::{
    AssistantContent, DocumentMediaType, ImageMediaType, Message, ToolChoice, UserContent,
};
use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::debug;

use crate::classify::schema::ExtractionSchema;
use crate::config::ClassifierConfig;
use crate::error::ClassificationError;

const TOOL_NAME: &str = "record_document";
const MAX_OUTPUT_TOKENS: u64 = 2048;

const SYSTEM_PROMPT: &str = "You read customer-submitted utility documents: electricity bills, \
gas bills and photos of meters. Identify the document type and extract the requested fields \
exactly as printed. Use null for anything you cannot read. Give every extracted field a \
confidence between 0 and 1.";

/// Media types the model accepts.
pub const SUPPORTED_MEDIA_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "application/pdf",
];

/// Input for one extraction call.
pub struct VisionRequest<'a> {
    pub file_bytes: &'a [u8],
    pub media_type: &'a str,
    pub schema: &'a ExtractionSchema,
}

/// A multimodal model that classifies a document and extracts fields.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Model identifier, recorded on the ParseResult.
    fn model_name(&self) -> &str;

    /// Return the raw structured output. Validation is the caller's job.
    async fn extract(&self, request: VisionRequest<'_>) -> Result<Value, ClassificationError>;
}

/// Anthropic vision model through rig-core.
pub fn anthropic_vision(
    config: &ClassifierConfig,
) -> Result<Arc<dyn VisionModel>, ClassificationError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            ClassificationError::ModelRequest {
                model: config.model.clone(),
                reason: format!("Failed to create Anthropic client: {e}"),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic vision (model: {})", config.model);
    Ok(Arc::new(RigVision::new(model, &config.model)))
}

/// Bridges a rig completion model to [`VisionModel`].
pub struct RigVision<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigVision<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }

    fn request_failed(&self, reason: String) -> ClassificationError {
        ClassificationError::ModelRequest {
            model: self.model_name.clone(),
            reason,
        }
    }
}

#[async_trait]
impl<M> VisionModel for RigVision<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn extract(&self, request: VisionRequest<'_>) -> Result<Value, ClassificationError> {
        let message = user_message(&request)?;
        let completion = self
            .model
            .completion_request(message)
            .preamble(SYSTEM_PROMPT.to_string())
            .tool(tool_definition(request.schema))
            .tool_choice(ToolChoice::Specific {
                function_names: vec![TOOL_NAME.to_string()],
            })
            .max_tokens(MAX_OUTPUT_TOKENS)
            .build();

        let response = self
            .model
            .completion(completion)
            .await
            .map_err(|e| self.request_failed(e.to_string()))?;

        debug!(model = %self.model_name, "Vision model responded");
        tool_input(response.choice)
    }
}

fn tool_definition(schema: &ExtractionSchema) -> ToolDefinition {
    ToolDefinition {
        name: TOOL_NAME.to_string(),
        description: "Record the document classification and extracted fields.".to_string(),
        parameters: schema.to_json_schema(),
    }
}

/// The file as a document or image block, followed by the instruction.
fn user_message(request: &VisionRequest<'_>) -> Result<Message, ClassificationError> {
    let data = BASE64.encode(request.file_bytes);
    let file = match request.media_type {
        "application/pdf" => UserContent::document(data, Some(DocumentMediaType::PDF)),
        "image/jpeg" => UserContent::image_base64(data, Some(ImageMediaType::JPEG), None),
        "image/png" => UserContent::image_base64(data, Some(ImageMediaType::PNG), None),
        "image/gif" => UserContent::image_base64(data, Some(ImageMediaType::GIF), None),
        "image/webp" => UserContent::image_base64(data, Some(ImageMediaType::WEBP), None),
        other => return Err(ClassificationError::UnsupportedMediaType(other.to_string())),
    };

    Ok(Message::User {
        content: OneOrMany::many(vec![
            file,
            UserContent::text("Classify this document and extract its fields."),
        ])
        .map_err(|e| ClassificationError::InvalidOutput(e.to_string()))?,
    })
}

/// Pull the forced tool call's arguments out of the reply.
fn tool_input(choice: OneOrMany<AssistantContent>) -> Result<Value, ClassificationError> {
    choice
        .into_iter()
        .find_map(|content| match content {
            AssistantContent::ToolCall(call) if call.function.name == TOOL_NAME => {
                Some(call.function.arguments)
            }
            _ => None,
        })
        .ok_or_else(|| {
            ClassificationError::InvalidOutput(format!("no {TOOL_NAME} tool call in response"))
        })
}

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Body returned for every failed request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable description
    pub error: String,

    /// Machine-readable code, present on business errors
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "insufficient_balance")]
    pub code: Option<String>,
}

/// The chat message to update once a transfer is confirmed
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReplyRequest {
    pub chat_id: String,

    pub message_id: i64,

    /// Message template
    pub text: String,

    /// Formatting parameters for `text`
    #[schema(value_type = Option<Object>)]
    pub text_params: Option<serde_json::Value>,
}

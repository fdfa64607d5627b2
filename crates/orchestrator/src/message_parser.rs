use serde::de::DeserializeOwned;
use tracing::warn;

pub struct MessageParser;

impl MessageParser {
    /// Locate the JSON body in free-text model output.
    ///
    /// Tries a ```json fence, then a bare fence opening on `{`, then the span
    /// from the first `{` to the last `}`; otherwise returns the input.
    pub fn extract_json_from_response(content: &str) -> String {
        if let Some(start) = content.find("```json") {
            let body = &content[start + 7..];
            if let Some(end) = body.find("```") {
                return body[..end].trim().to_string();
            }
        }

        if let Some(start) = content.find("```\n{") {
            if let Some(end) = content[start + 4..].find("\n```") {
                return content[start + 4..start + 4 + end].trim().to_string();
            }
        }

        if let Some(start) = content.find('{') {
            if let Some(end) = content.rfind('}') {
                if end > start {
                    return content[start..=end].to_string();
                }
            }
        }

        content.to_string()
    }

    /// Parse the embedded JSON as `T`, or `None` when it is absent or malformed.
    pub fn parse<T: DeserializeOwned>(content: &str) -> Option<T> {
        let json_str = Self::extract_json_from_response(content);
        match serde_json::from_str::<T>(&json_str) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    error = %e,
                    content_preview = %content.chars().take(300).collect::<String>(),
                    "Failed to parse agent JSON, using fallback"
                );
                None
            }
        }
    }
}

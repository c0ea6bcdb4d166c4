//! Item extraction from receipt and grocery photos.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use solimesh_vision::{GenerateContentRequest, Part, VisionClient};

pub const EXTRACTION_PROMPT: &str = "Extract all food items from this receipt or grocery image. \
                                     Return as JSON array with item names only.";

pub const DEFAULT_MIME: &str = "image/jpeg";

/// Item names read off an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub items: Vec<String>,
    /// The model answered but not with a JSON array of strings.
    pub parse_failed: bool,
}

impl Extraction {
    fn failed() -> Self {
        Self {
            items: Vec::new(),
            parse_failed: true,
        }
    }
}

/// Strip a Markdown code fence (```json ... ```) if the text is wrapped in one.
fn unfence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string, e.g. `json`.
    match body.split_once('\n') {
        Some((_, inner)) => inner.trim(),
        None => body.trim(),
    }
}

/// Parse model output into item names.
pub fn parse_items(text: &str) -> Extraction {
    let items = match serde_json::from_str::<Value>(unfence(text)) {
        Ok(Value::Array(values)) => values
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect::<Option<Vec<String>>>(),
        _ => None,
    };
    match items {
        Some(items) => Extraction {
            items,
            parse_failed: false,
        },
        None => {
            warn!(text_len = text.len(), "extraction output was not a JSON array of strings");
            Extraction::failed()
        }
    }
}

/// Split `data:<mime>;base64,<payload>` into its mime and payload. Plain
/// base64 passes through with the default mime.
fn split_data_url(image: &str) -> (&str, &str) {
    let Some(rest) = image.strip_prefix("data:") else {
        return (DEFAULT_MIME, image);
    };
    match rest.split_once(',') {
        Some((header, payload)) => {
            let mime = header.split(';').next().filter(|m| !m.is_empty());
            (mime.unwrap_or(DEFAULT_MIME), payload)
        }
        None => (DEFAULT_MIME, image),
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionClient {
    vision: VisionClient,
}

impl ExtractionClient {
    pub fn new(vision: VisionClient) -> Self {
        Self { vision }
    }

    /// Extract items from a base64 image, optionally given as a data URL.
    pub async fn extract_items(&self, image_base64: &str) -> Result<Extraction> {
        let (mime, data) = split_data_url(image_base64.trim());
        let request = GenerateContentRequest::from_parts(vec![
            Part::text(EXTRACTION_PROMPT),
            Part::inline_data(mime, data),
        ]);
        debug!(mime, model = self.vision.model(), "extracting items");

        let response = self.vision.generate_content(&request).await?;
        match response.first_text() {
            Some(text) => Ok(parse_items(text)),
            None => {
                warn!("extraction response had no text part");
                Ok(Extraction::failed())
            }
        }
    }

    pub async fn extract_items_from_bytes(&self, bytes: &[u8], mime: &str) -> Result<Extraction> {
        let encoded = STANDARD.encode(bytes);
        self.extract_items(&format!("data:{};base64,{}", mime, encoded))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_items() {
        let parsed = parse_items(r#"["Milk","Eggs"]"#);
        assert_eq!(parsed.items, vec!["Milk", "Eggs"]);
        assert!(!parsed.parse_failed);

        let parsed = parse_items("not json");
        assert!(parsed.items.is_empty());
        assert!(parsed.parse_failed);
    }

    #[test]
    fn test_parse_rejects_non_strings_and_objects() {
        assert!(parse_items(r#"["Milk", 3]"#).parse_failed);
        assert!(parse_items(r#"{"items": ["Milk"]}"#).parse_failed);
        assert!(!parse_items("[]").parse_failed);
    }

    #[test]
    fn test_parse_tolerates_code_fence() {
        let parsed = parse_items("```json\n[\"Bread\"]\n```");
        assert_eq!(parsed.items, vec!["Bread"]);

        let parsed = parse_items("```[\"Rice\"]```");
        assert_eq!(parsed.items, vec!["Rice"]);
    }

    #[test]
    fn test_split_data_url() {
        assert_eq!(split_data_url("AAAA"), ("image/jpeg", "AAAA"));
        assert_eq!(split_data_url("data:image/png;base64,BBBB"), ("image/png", "BBBB"));
        assert_eq!(split_data_url("data:;base64,CCCC"), ("image/jpeg", "CCCC"));
    }
}

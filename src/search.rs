//! Image similarity search: the search service returns reference images
//! close to one the user sent, and they are kept in the conversation as
//! agent images.

use crate::constants::{DEFAULT_SEARCH_TOP_K, SEARCH_IMAGE_BUCKET};
use crate::ingress::S3Location;
use crate::models::NewImageMessage;
use crate::persist::SavedImage;
use crate::store::Store;
use crate::types::{RelayError, Result, Sender};
use crate::upstream::UpstreamClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimilarityRequest {
    #[serde(default)]
    pub image_id: Option<i64>,
    #[serde(default)]
    pub top_k: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchBody {
    pub image: S3Location,
    pub top_k: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchReply {
    #[serde(default)]
    retrieved_images: Vec<RetrievedImage>,
}

#[derive(Debug, Clone, Deserialize)]
struct RetrievedImage {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    metadata: Value,
}

/// A search hit with its metadata already rendered as markdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedImage {
    pub url: Option<String>,
    pub metadata: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarityResponse {
    pub retrieved_images: Vec<RenderedImage>,
    pub images: Vec<SavedImage>,
}

/// Object key of a stored image: everything after the S3 host.
pub fn image_key(image_url: &str) -> &str {
    image_url
        .rsplit(".amazonaws.com/")
        .next()
        .unwrap_or(image_url)
}

/// `### <key>\n<value>\n` per metadata entry, entries separated by a blank
/// line.
pub fn metadata_markdown(metadata: &Value) -> String {
    match metadata {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("### {}\n{}\n", k, s),
                other => format!("### {}\n{}\n", k, other),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[derive(Clone)]
pub struct SimilaritySearch {
    upstream: UpstreamClient,
    store: Store,
}

impl SimilaritySearch {
    pub fn new(upstream: UpstreamClient, store: Store) -> Self {
        Self { upstream, store }
    }

    /// Sends the conversation's image to the search service and saves every
    /// hit with a URL as an agent image carrying the requested `top_k`.
    pub async fn run(
        &self,
        endpoint: &str,
        conversation_id: &str,
        request: SimilarityRequest,
    ) -> Result<SimilarityResponse> {
        let image_id = match request.image_id {
            Some(id) => id,
            None => return Err(RelayError::Validation("image_id is required".to_string()).into()),
        };
        let top_k = request.top_k.unwrap_or(DEFAULT_SEARCH_TOP_K);
        if top_k < 1 {
            return Err(RelayError::Validation("top_k must be a positive integer".to_string()).into());
        }

        let image = match self.store.find_image_message(image_id).await? {
            Some(i) if i.conversation_id == conversation_id => i,
            _ => {
                return Err(
                    RelayError::Validation(format!("image message {} not found", image_id)).into(),
                )
            }
        };
        let image_url = match image.image_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => url,
            None => {
                return Err(RelayError::Validation(format!(
                    "image message {} has no url to search with",
                    image_id
                ))
                .into())
            }
        };

        let body = SearchBody {
            image: S3Location {
                bucket: SEARCH_IMAGE_BUCKET.to_string(),
                key: image_key(image_url).to_string(),
            },
            top_k,
        };
        let reply = self
            .upstream
            .search(endpoint, &serde_json::to_value(&body)?)
            .await?;
        let reply: SearchReply = match serde_json::from_value(reply) {
            Ok(r) => r,
            Err(e) => {
                return Err(RelayError::Decode(format!("search reply is malformed: {}", e)).into())
            }
        };

        let retrieved_images: Vec<RenderedImage> = reply
            .retrieved_images
            .into_iter()
            .map(|hit| RenderedImage {
                url: hit.url,
                metadata: metadata_markdown(&hit.metadata),
            })
            .collect();

        let mut images = Vec::new();
        for hit in &retrieved_images {
            let Some(url) = hit.url.clone().filter(|u| !u.is_empty()) else {
                tracing::warn!("Skipping search hit without a url");
                continue;
            };
            let new = NewImageMessage {
                image_url: Some(url),
                image_key: None,
                metadata: Some(hit.metadata.clone()),
                top_k: Some(top_k),
                sender: Sender::Ai,
                machine_model: None,
            };
            match self.store.create_image_message(conversation_id, &new).await {
                Ok(saved) => images.push(SavedImage {
                    id: saved.id,
                    image_url: saved.image_url,
                    metadata: saved.metadata,
                }),
                Err(e) => tracing::error!("Failed to save search hit: {}", e.inner),
            }
        }

        tracing::info!(
            "Similarity search for image {} on [{}...]: {} hits, {} saved",
            image_id,
            crate::str_utils::prefix_chars(conversation_id, 8),
            retrieved_images.len(),
            images.len()
        );

        Ok(SimilarityResponse {
            retrieved_images,
            images,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_taken_after_the_s3_host() {
        assert_eq!(
            image_key("https://zbot-input.s3.amazonaws.com/u-1/part.png"),
            "u-1/part.png"
        );
        assert_eq!(image_key("u-1/part.png"), "u-1/part.png");
    }

    #[test]
    fn metadata_renders_as_markdown_sections() {
        let rendered = metadata_markdown(&json!({"cavity": 2, "defect": "sink mark"}));
        assert_eq!(rendered, "### cavity\n2\n\n### defect\nsink mark\n");
        assert_eq!(metadata_markdown(&Value::Null), "");
    }
}

use crate::ingress::ImageQueryRef;
use crate::models::{ImageMetadata, NewImageMessage, NewTextMessage};
use crate::store::Store;
use crate::types::{RelayError, Result, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Final agent answer: free text plus any reference images it picked.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AgentResponse {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub images: Option<AgentImages>,
    /// Agent's caption for the image the user sent, if any.
    #[serde(default, rename = "imageInputDescription")]
    pub image_input_description: Option<String>,
}

/// The agent reports images either column-wise or as a list of records.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AgentImages {
    Columns {
        #[serde(default)]
        images: Vec<String>,
        #[serde(default)]
        descriptions: Vec<Option<String>>,
        #[serde(default)]
        utilities: Vec<Option<String>>,
    },
    List(Vec<AgentImage>),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AgentImage {
    #[serde(alias = "image_url")]
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub utility: Option<String>,
}

impl AgentImages {
    /// Row-wise view; a column shorter than `images` leaves the rest unset.
    pub fn into_records(self) -> Vec<AgentImage> {
        match self {
            AgentImages::List(list) => list,
            AgentImages::Columns {
                images,
                descriptions,
                utilities,
            } => images
                .into_iter()
                .enumerate()
                .map(|(i, url)| AgentImage {
                    url,
                    description: descriptions.get(i).cloned().flatten(),
                    utility: utilities.get(i).cloned().flatten(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedText {
    pub id: i64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedImage {
    pub id: i64,
    pub image_url: Option<String>,
    pub metadata: Option<String>,
}

/// What got written for one agent answer. Sent to the client as the last
/// frame of a relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistSummary {
    pub text: Option<SavedText>,
    pub images: Vec<SavedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PersistSummary {
    /// Summary used when no real one arrived in time.
    pub fn fallback(reason: &str) -> Self {
        Self {
            text: None,
            images: Vec::new(),
            error: Some(reason.to_string()),
        }
    }
}

/// Where an answer belongs.
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub conversation_id: String,
    pub machine_model: Option<String>,
    pub image_query: Option<ImageQueryRef>,
}

/// The final streamed payload is a JSON string whose content is the JSON
/// document; both layers are decoded here.
pub fn decode_double_encoded(raw: &str) -> Result<AgentResponse> {
    let outer: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| RelayError::Decode(format!("final payload is not JSON: {}", e)))?;
    let inner = match outer {
        serde_json::Value::String(s) => s,
        other => {
            return Err(RelayError::Decode(format!(
                "final payload should be a JSON string, got {}",
                json_kind(&other)
            ))
            .into())
        }
    };
    let response = serde_json::from_str::<AgentResponse>(&inner)
        .map_err(|e| RelayError::Decode(format!("final payload content is malformed: {}", e)))?;
    Ok(response)
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Writes agent answers to the store.
#[derive(Clone)]
pub struct ResponsePersister {
    store: Store,
}

impl ResponsePersister {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Runs [`Self::persist_raw`] as its own task and hands the summary
    /// through `done`. A malformed payload sends nothing; the receiver then
    /// observes the dropped sender.
    pub fn spawn(
        &self,
        raw: String,
        job: PersistJob,
        done: oneshot::Sender<PersistSummary>,
    ) -> JoinHandle<()> {
        let persister = self.clone();
        let span = tracing::info_span!(
            "persist",
            cid = %crate::str_utils::prefix_chars(&job.conversation_id, 8)
        );

        tokio::spawn(
            async move {
                match persister.persist_raw(&raw, &job).await {
                    Ok(summary) => {
                        if done.send(summary).is_err() {
                            tracing::debug!("Relay stopped waiting before the summary was ready");
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            "Discarding agent response for [{}...]: {}",
                            crate::str_utils::prefix_chars(&job.conversation_id, 8),
                            e.inner
                        );
                    }
                }
            }
            .instrument(span),
        )
    }

    pub async fn persist_raw(&self, raw: &str, job: &PersistJob) -> Result<PersistSummary> {
        let response = decode_double_encoded(raw)?;
        Ok(self.persist(response, job).await)
    }

    /// Saves the caption for the user's image, then the answer text, then
    /// each returned image. A failing record is logged and skipped.
    pub async fn persist(&self, response: AgentResponse, job: &PersistJob) -> PersistSummary {
        let caption = response
            .image_input_description
            .filter(|d| !d.trim().is_empty());
        if let (Some(query), Some(caption)) = (&job.image_query, caption) {
            match self.store.update_image_metadata(query.id, &caption).await {
                Ok(true) => tracing::debug!("Captioned input image {}", query.id),
                Ok(false) => tracing::warn!("Input image {} not found for caption", query.id),
                Err(e) => tracing::error!("Failed to caption input image {}: {}", query.id, e.inner),
            }
        }

        let mut summary = PersistSummary::default();

        if let Some(text) = response.response.filter(|t| !t.is_empty()) {
            let new = NewTextMessage {
                text,
                sender: Sender::Ai,
                machine_model: job.machine_model.clone(),
            };
            match self.store.create_text_message(&job.conversation_id, &new).await {
                Ok(saved) => {
                    summary.text = Some(SavedText {
                        id: saved.id,
                        text: saved.text,
                    })
                }
                Err(e) => tracing::error!("Failed to save agent text: {}", e.inner),
            }
        }

        let images = response.images.map(AgentImages::into_records).unwrap_or_default();
        for image in images {
            let metadata =
                ImageMetadata::new(image.description.as_deref(), image.utility.as_deref()).encode();
            let new = NewImageMessage {
                image_url: Some(image.url),
                image_key: None,
                metadata: Some(metadata),
                top_k: None,
                sender: Sender::Ai,
                machine_model: job.machine_model.clone(),
            };
            match self.store.create_image_message(&job.conversation_id, &new).await {
                Ok(saved) => summary.images.push(SavedImage {
                    id: saved.id,
                    image_url: saved.image_url,
                    metadata: saved.metadata,
                }),
                Err(e) => tracing::error!("Failed to save agent image: {}", e.inner),
            }
        }

        tracing::info!(
            "Saved agent response for [{}...]: text={} images={}",
            crate::str_utils::prefix_chars(&job.conversation_id, 8),
            summary.text.is_some(),
            summary.images.len()
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn final_payload_is_decoded_twice() {
        let inner = json!({
            "response": "Raise the mold temperature.",
            "images": {"images": ["https://b.s3.amazonaws.com/a.png"], "descriptions": ["short shot"], "utilities": []},
            "imageInputDescription": "sink mark near rib"
        })
        .to_string();
        let raw = serde_json::to_string(&inner).unwrap();

        let decoded = decode_double_encoded(&raw).unwrap();
        assert_eq!(decoded.response.as_deref(), Some("Raise the mold temperature."));
        assert_eq!(decoded.image_input_description.as_deref(), Some("sink mark near rib"));

        let records = decoded.images.map(AgentImages::into_records).unwrap_or_default();
        assert_eq!(
            records,
            vec![AgentImage {
                url: "https://b.s3.amazonaws.com/a.png".into(),
                description: Some("short shot".into()),
                utility: None,
            }]
        );
    }

    #[test]
    fn single_encoded_payload_is_rejected() {
        let raw = json!({"response": "hi"}).to_string();
        assert!(decode_double_encoded(&raw).is_err());
        assert!(decode_double_encoded("").is_err());
    }

    #[test]
    fn list_shaped_images_are_accepted() {
        let images: AgentImages = serde_json::from_value(json!([
            {"url": "https://x/1.png", "description": "d", "utility": "u"},
            {"image_url": "https://x/2.png"}
        ]))
        .unwrap();
        let records = images.into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].url, "https://x/2.png");
        assert_eq!(records[1].description, None);
    }

    #[test]
    fn empty_image_object_means_no_images() {
        let raw = serde_json::to_string(&json!({"response": "ok", "images": {}}).to_string()).unwrap();
        let decoded = decode_double_encoded(&raw).unwrap();
        assert!(decoded.images.map(AgentImages::into_records).unwrap_or_default().is_empty());
    }

    #[test]
    fn fallback_summary_carries_error() {
        let v = serde_json::to_value(PersistSummary::fallback("timed out")).unwrap();
        assert_eq!(v, json!({"text": null, "images": [], "error": "timed out"}));
        let ok = serde_json::to_value(PersistSummary::default()).unwrap();
        assert_eq!(ok, json!({"text": null, "images": []}));
    }
}

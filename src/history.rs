use crate::constants::{
    CONTEXT_WINDOW_MESSAGES, CONTEXT_WINDOW_MINUTES, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT,
};
use crate::models::{minute_floor_micros, to_micros, ParameterSnapshot};
use crate::store::{FeedKey, FeedKind, Store};
use crate::types::{AgentMode, RelayError, Result, Sender};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One item of the merged conversation feed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationEvent {
    pub id: String,
    #[serde(flatten)]
    pub body: EventBody,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventBody {
    Text {
        data: String,
    },
    Image {
        data: Option<String>,
        image_utility: Option<String>,
    },
    Parameter {
        data: Option<String>,
        #[serde(rename = "fineTuning")]
        fine_tuning: ParameterSnapshot,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryPage {
    pub items: Vec<ConversationEvent>,
    pub total_count: i64,
}

impl HistoryPage {
    pub fn next_offset(&self, limit: i64, offset: i64) -> Option<i64> {
        let next = offset + limit;
        (next < self.total_count).then_some(next)
    }

    pub fn previous_offset(&self, limit: i64, offset: i64) -> Option<i64> {
        (offset > 0).then(|| (offset - limit).max(0))
    }
}

/// Applies defaults and bounds to client pagination parameters.
pub fn normalize_page(limit: Option<i64>, offset: Option<i64>) -> Result<(i64, i64)> {
    let limit = match limit {
        None => DEFAULT_PAGE_LIMIT,
        Some(l) if l < 1 => {
            return Err(RelayError::Validation("limit must be a positive integer".into()).into())
        }
        Some(l) => l.min(MAX_PAGE_LIMIT),
    };
    let offset = match offset {
        None => 0,
        Some(o) if o < 0 => {
            return Err(RelayError::Validation("start must not be negative".into()).into())
        }
        Some(o) => o,
    };
    Ok((limit, offset))
}

/// A prior message as the agent sees it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContextEntry {
    pub role: Sender,
    pub message: String,
    #[serde(rename = "imageDescription", skip_serializing_if = "Option::is_none")]
    pub image_description: Option<Vec<String>>,
    /// Recipes in effect around the message. Kept for ops; not sent upstream.
    #[serde(skip)]
    pub parameters: Vec<ParameterSnapshot>,
}

#[derive(Clone)]
pub struct HistoryAggregator {
    store: Store,
}

impl HistoryAggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Newest-first slice of the merged text/image/parameter feed plus the
    /// total number of live items in the conversation.
    pub async fn page(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<HistoryPage> {
        let total_count = self.store.feed_count(conversation_id).await?;
        let keys = self.store.feed_slice(conversation_id, limit, offset).await?;

        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            match self.hydrate(&key).await? {
                Some(event) => items.push(event),
                None => tracing::debug!(
                    "History item {:?} {} disappeared while paging",
                    key.kind,
                    key.id
                ),
            }
        }

        tracing::debug!(
            "History page for [{}...]: {} items (offset {}, limit {}, total {})",
            crate::str_utils::prefix_chars(conversation_id, 8),
            items.len(),
            offset,
            limit,
            total_count
        );

        Ok(HistoryPage { items, total_count })
    }

    async fn hydrate(&self, key: &FeedKey) -> Result<Option<ConversationEvent>> {
        match key.kind {
            FeedKind::Text => {
                let message = self.store.find_text_message(numeric_id(&key.id)?).await?;
                Ok(message.map(|m| ConversationEvent {
                    id: m.id.to_string(),
                    body: EventBody::Text { data: m.text },
                    sender: m.sender,
                    created_at: m.created_at,
                }))
            }
            FeedKind::Image => {
                let image = self.store.find_image_message(numeric_id(&key.id)?).await?;
                Ok(image.map(|m| ConversationEvent {
                    id: m.id.to_string(),
                    body: EventBody::Image {
                        data: m.image_url,
                        image_utility: m.metadata,
                    },
                    sender: m.sender,
                    created_at: m.created_at,
                }))
            }
            FeedKind::Parameter => {
                let parameter = self.store.find_machine_parameter(&key.id).await?;
                Ok(parameter.map(|p| ConversationEvent {
                    id: p.id.clone(),
                    body: EventBody::Parameter {
                        data: p.title.clone(),
                        fine_tuning: p.snapshot(),
                    },
                    sender: Sender::User,
                    created_at: p.created_at,
                }))
            }
        }
    }

    /// Up to twelve prior text messages, oldest first, each decorated with
    /// what happened in the two minutes starting at its minute: same-sender
    /// image descriptions and the recipes in effect.
    pub async fn context_window(
        &self,
        exclude_text_message_id: i64,
        conversation_id: &str,
        purpose: AgentMode,
    ) -> Result<Vec<ContextEntry>> {
        let mut messages = self
            .store
            .recent_text_messages(conversation_id, exclude_text_message_id, CONTEXT_WINDOW_MESSAGES)
            .await?;
        messages.reverse();

        let window_micros = CONTEXT_WINDOW_MINUTES * 60 * 1_000_000;
        let mut entries = Vec::with_capacity(messages.len());

        for message in messages {
            let start = minute_floor_micros(to_micros(message.created_at));
            let end = start + window_micros;

            let images = self
                .store
                .images_in_window(conversation_id, message.sender, start, end)
                .await?;

            let mut parameters = self
                .store
                .parameters_in_window(conversation_id, start, end)
                .await?;
            if parameters.is_empty() {
                if let Some(previous) = self
                    .store
                    .latest_parameter_before(conversation_id, start)
                    .await?
                {
                    parameters.push(previous);
                }
            }

            let image_description = match purpose {
                AgentMode::Ops => None,
                AgentMode::Chat => Some(images.iter().map(|i| i.description()).collect()),
            };

            entries.push(ContextEntry {
                role: message.sender,
                message: message.text,
                image_description,
                parameters: parameters.iter().map(|p| p.snapshot()).collect(),
            });
        }

        tracing::debug!(
            "Context window for [{}...]: {} messages ({})",
            crate::str_utils::prefix_chars(conversation_id, 8),
            entries.len(),
            purpose
        );

        Ok(entries)
    }
}

fn numeric_id(raw: &str) -> Result<i64> {
    match raw.parse::<i64>() {
        Ok(id) => Ok(id),
        Err(e) => Err(RelayError::Internal(
            format!("feed id '{}' is not numeric: {}", raw, e),
            tracing_error::SpanTrace::capture(),
        )
        .into()),
    }
}

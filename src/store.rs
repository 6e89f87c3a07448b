use crate::db::DbPool;
use crate::models::*;
use crate::types::{RelayError, Result, Sender};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str =
    "id, name, title, type, user_id, is_deleted, created_at, updated_at";
const TEXT_COLUMNS: &str =
    "id, conversation_id, text, machine_model, sender, is_deleted, created_at, updated_at";
const IMAGE_COLUMNS: &str = "id, conversation_id, image_url, image_key, metadata, top_k, \
     machine_model, sender, is_deleted, created_at, updated_at";
const MACHINE_COLUMNS: &str = "id, name, number, type, manufacturer, production_year, \
     expiration_year, clamping_force, screw_diameter, screw_stroke, shot_volume, \
     max_sys_pressure, injection_pressure, company_id, created_at, updated_at";
const MATERIAL_COLUMNS: &str = "id, type, melt_density, quantity, created_at, updated_at";
const PARAMETER_COLUMNS: &str = "id, title, injection_temperature, position, \
     injection_pressure, velocity, hold_pressure, hold_velocity, hold_time, back_pressure, \
     mold_temperature, cooling_time, hot_runner_temperature, decompression, clamping_force, \
     injection_weight, num_cavities, single_product_weight, nozzle_weight, clamping_pressure, \
     material_id, machine_id, conversation_id, created_at, updated_at";

/// One entry of the merged conversation feed before hydration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedKey {
    pub kind: FeedKind,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Text,
    Image,
    Parameter,
}

impl FeedKind {
    fn from_column(raw: &str) -> Result<Self> {
        match raw {
            "text" => Ok(FeedKind::Text),
            "image" => Ok(FeedKind::Image),
            "parameter" => Ok(FeedKind::Parameter),
            other => Err(RelayError::Internal(
                format!("unknown feed kind '{}'", other),
                tracing_error::SpanTrace::capture(),
            )
            .into()),
        }
    }
}

/// Data access for conversations, messages, recipes and reference data.
/// Every message query filters soft-deleted rows unless stated otherwise.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // --- conversations ---

    pub async fn create_conversation(
        &self,
        user_id: &str,
        new: &NewConversation,
    ) -> Result<Conversation> {
        let id = Uuid::new_v4().to_string();
        let name = match &new.name {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => id.clone(),
        };
        let title = new.title.clone().unwrap_or_default();
        let now = to_micros(Utc::now());

        let inserted = sqlx::query(
            r#"
            INSERT INTO conversations (id, name, title, type, user_id, is_deleted, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&name)
        .bind(&title)
        .bind(&new.kind)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(RelayError::Validation(format!(
                    "conversation name '{}' is already taken",
                    name
                ))
                .into())
            }
            Err(e) => return Err(e.into()),
        }

        self.get_conversation(&id).await
    }

    /// Live conversation by id.
    pub async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conversations WHERE id = ? AND is_deleted = 0",
            CONVERSATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => conversation_from_row(&r),
            None => Err(RelayError::NotFound(format!("conversation {} not found", id)).into()),
        }
    }

    /// Live conversation, additionally scoped to its owner when one is given.
    pub async fn get_conversation_for(
        &self,
        id: &str,
        user_id: Option<&str>,
    ) -> Result<Conversation> {
        let conversation = self.get_conversation(id).await?;
        match user_id {
            Some(user) if user != conversation.user_id => {
                Err(RelayError::NotFound(format!("conversation {} not found", id)).into())
            }
            _ => Ok(conversation),
        }
    }

    // --- text messages ---

    pub async fn create_text_message(
        &self,
        conversation_id: &str,
        new: &NewTextMessage,
    ) -> Result<TextMessage> {
        self.insert_text_message(conversation_id, new, Utc::now())
            .await
    }

    pub async fn insert_text_message(
        &self,
        conversation_id: &str,
        new: &NewTextMessage,
        at: DateTime<Utc>,
    ) -> Result<TextMessage> {
        let ts = to_micros(at);
        let result = sqlx::query(
            r#"
            INSERT INTO text_messages (conversation_id, text, machine_model, sender, is_deleted, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(conversation_id)
        .bind(&new.text)
        .bind(&new.machine_model)
        .bind(new.sender.as_str())
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(TextMessage {
            id: result.last_insert_rowid(),
            conversation_id: conversation_id.to_string(),
            text: new.text.clone(),
            sender: new.sender,
            machine_model: new.machine_model.clone(),
            is_deleted: false,
            created_at: from_micros(ts),
            updated_at: from_micros(ts),
        })
    }

    pub async fn find_text_message(&self, id: i64) -> Result<Option<TextMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM text_messages WHERE id = ? AND is_deleted = 0",
            TEXT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(text_message_from_row).transpose()
    }

    pub async fn soft_delete_text_message(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE text_messages SET is_deleted = 1, updated_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(to_micros(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Most recent live text messages of a conversation, newest first.
    pub async fn recent_text_messages(
        &self,
        conversation_id: &str,
        exclude_id: i64,
        limit: i64,
    ) -> Result<Vec<TextMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM text_messages
            WHERE conversation_id = ? AND id <> ? AND is_deleted = 0
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
            TEXT_COLUMNS
        ))
        .bind(conversation_id)
        .bind(exclude_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(text_message_from_row).collect()
    }

    // --- image messages ---

    pub async fn create_image_message(
        &self,
        conversation_id: &str,
        new: &NewImageMessage,
    ) -> Result<ImageMessage> {
        self.insert_image_message(conversation_id, new, Utc::now())
            .await
    }

    pub async fn insert_image_message(
        &self,
        conversation_id: &str,
        new: &NewImageMessage,
        at: DateTime<Utc>,
    ) -> Result<ImageMessage> {
        let has_url = new.image_url.as_deref().is_some_and(|u| !u.is_empty());
        let has_key = new.image_key.as_deref().is_some_and(|k| !k.is_empty());
        if !has_url && !has_key {
            return Err(RelayError::Validation(
                "an image message needs an image_url or an image_key".to_string(),
            )
            .into());
        }

        let ts = to_micros(at);
        let top_k = new.top_k.or(Some(1));
        let result = sqlx::query(
            r#"
            INSERT INTO image_messages
                (conversation_id, image_url, image_key, metadata, top_k, machine_model, sender, is_deleted, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(conversation_id)
        .bind(&new.image_url)
        .bind(&new.image_key)
        .bind(&new.metadata)
        .bind(top_k)
        .bind(&new.machine_model)
        .bind(new.sender.as_str())
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(ImageMessage {
            id: result.last_insert_rowid(),
            conversation_id: conversation_id.to_string(),
            image_url: new.image_url.clone(),
            image_key: new.image_key.clone(),
            metadata: new.metadata.clone(),
            top_k,
            sender: new.sender,
            machine_model: new.machine_model.clone(),
            is_deleted: false,
            created_at: from_micros(ts),
            updated_at: from_micros(ts),
        })
    }

    pub async fn find_image_message(&self, id: i64) -> Result<Option<ImageMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM image_messages WHERE id = ? AND is_deleted = 0",
            IMAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(image_message_from_row).transpose()
    }

    /// Overwrites an image's metadata in place; last write wins.
    pub async fn update_image_metadata(&self, id: i64, metadata: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE image_messages SET metadata = ?, updated_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(metadata)
        .bind(to_micros(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn soft_delete_image_message(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE image_messages SET is_deleted = 1, updated_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(to_micros(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Live images by one sender created in `[start, end)`, oldest first.
    pub async fn images_in_window(
        &self,
        conversation_id: &str,
        sender: Sender,
        start_micros: i64,
        end_micros: i64,
    ) -> Result<Vec<ImageMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM image_messages
            WHERE conversation_id = ? AND sender = ? AND is_deleted = 0
              AND created_at >= ? AND created_at < ?
            ORDER BY created_at ASC, id ASC
            "#,
            IMAGE_COLUMNS
        ))
        .bind(conversation_id)
        .bind(sender.as_str())
        .bind(start_micros)
        .bind(end_micros)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(image_message_from_row).collect()
    }

    // --- reference data ---

    pub async fn create_machine(&self, new: &NewMachine) -> Result<Machine> {
        let id = Uuid::new_v4().to_string();
        let now = to_micros(Utc::now());
        let inserted = sqlx::query(
            r#"
            INSERT INTO machines
                (id, name, number, type, manufacturer, production_year, expiration_year,
                 clamping_force, screw_diameter, screw_stroke, shot_volume, max_sys_pressure,
                 injection_pressure, company_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(&new.number)
        .bind(&new.kind)
        .bind(&new.manufacturer)
        .bind(new.production_year)
        .bind(new.expiration_year)
        .bind(new.clamping_force)
        .bind(new.screw_diameter)
        .bind(new.screw_stroke)
        .bind(new.shot_volume)
        .bind(new.max_sys_pressure)
        .bind(new.injection_pressure)
        .bind(&new.company_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(RelayError::Validation(format!(
                    "machine number '{}' is already registered",
                    new.number
                ))
                .into())
            }
            Err(e) => return Err(e.into()),
        }

        match self.find_machine(&id).await? {
            Some(m) => Ok(m),
            None => Err(RelayError::Persistence(format!("machine {} vanished after insert", id)).into()),
        }
    }

    pub async fn find_machine(&self, id: &str) -> Result<Option<Machine>> {
        let row = sqlx::query(&format!("SELECT {} FROM machines WHERE id = ?", MACHINE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(machine_from_row).transpose()
    }

    pub async fn create_material(&self, new: &NewMaterial) -> Result<Material> {
        let id = Uuid::new_v4().to_string();
        let now = to_micros(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO materials (id, type, melt_density, quantity, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.kind)
        .bind(new.melt_density)
        .bind(new.quantity)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Material {
            id,
            kind: new.kind.clone(),
            melt_density: new.melt_density,
            quantity: new.quantity,
            created_at: from_micros(now),
            updated_at: from_micros(now),
        })
    }

    pub async fn find_material(&self, id: &str) -> Result<Option<Material>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM materials WHERE id = ?",
            MATERIAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(material_from_row).transpose()
    }

    pub async fn delete_machine(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM machines WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- machine parameters ---

    pub async fn create_machine_parameter(
        &self,
        conversation_id: Option<&str>,
        new: &NewMachineParameter,
    ) -> Result<MachineParameter> {
        self.insert_machine_parameter(conversation_id, new, Utc::now())
            .await
    }

    pub async fn insert_machine_parameter(
        &self,
        conversation_id: Option<&str>,
        new: &NewMachineParameter,
        at: DateTime<Utc>,
    ) -> Result<MachineParameter> {
        new.recipe.validate()?;
        if let Some(machine_id) = &new.machine_id {
            if self.find_machine(machine_id).await?.is_none() {
                return Err(RelayError::Validation(format!("machine {} does not exist", machine_id)).into());
            }
        }
        if let Some(material_id) = &new.material_id {
            if self.find_material(material_id).await?.is_none() {
                return Err(
                    RelayError::Validation(format!("material {} does not exist", material_id)).into(),
                );
            }
        }

        let id = Uuid::new_v4().to_string();
        let ts = to_micros(at);
        let r = &new.recipe;

        let mut query = sqlx::query(
            r#"
            INSERT INTO machine_parameters
                (id, title, injection_temperature, position, injection_pressure, velocity,
                 hold_pressure, hold_velocity, hold_time, back_pressure,
                 mold_temperature, cooling_time, hot_runner_temperature, decompression,
                 clamping_force, injection_weight, num_cavities, single_product_weight,
                 nozzle_weight, clamping_pressure, material_id, machine_id, conversation_id,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.title);
        for (_, steps) in r.staged() {
            query = query.bind(serde_json::to_string(steps)?);
        }
        for (_, value) in r.scalars() {
            query = query.bind(value);
        }
        query
            .bind(&new.material_id)
            .bind(&new.machine_id)
            .bind(conversation_id)
            .bind(ts)
            .bind(ts)
            .execute(&self.pool)
            .await?;

        Ok(MachineParameter {
            id,
            title: new.title.clone(),
            recipe: new.recipe.clone(),
            material_id: new.material_id.clone(),
            machine_id: new.machine_id.clone(),
            conversation_id: conversation_id.map(str::to_string),
            created_at: from_micros(ts),
            updated_at: from_micros(ts),
        })
    }

    pub async fn find_machine_parameter(&self, id: &str) -> Result<Option<MachineParameter>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM machine_parameters WHERE id = ?",
            PARAMETER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parameter_from_row).transpose()
    }

    /// Parameters created in `[start, end)`, oldest first.
    pub async fn parameters_in_window(
        &self,
        conversation_id: &str,
        start_micros: i64,
        end_micros: i64,
    ) -> Result<Vec<MachineParameter>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM machine_parameters
            WHERE conversation_id = ? AND created_at >= ? AND created_at < ?
            ORDER BY created_at ASC, id ASC
            "#,
            PARAMETER_COLUMNS
        ))
        .bind(conversation_id)
        .bind(start_micros)
        .bind(end_micros)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parameter_from_row).collect()
    }

    /// Most recent parameter strictly before `before_micros`.
    pub async fn latest_parameter_before(
        &self,
        conversation_id: &str,
        before_micros: i64,
    ) -> Result<Option<MachineParameter>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM machine_parameters
            WHERE conversation_id = ? AND created_at < ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            PARAMETER_COLUMNS
        ))
        .bind(conversation_id)
        .bind(before_micros)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parameter_from_row).transpose()
    }

    // --- merged feed ---

    pub async fn feed_count(&self, conversation_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
                SELECT id FROM text_messages WHERE conversation_id = ? AND is_deleted = 0
                UNION ALL
                SELECT id FROM image_messages WHERE conversation_id = ? AND is_deleted = 0
                UNION ALL
                SELECT id FROM machine_parameters WHERE conversation_id = ?
            )
            "#,
        )
        .bind(conversation_id)
        .bind(conversation_id)
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Keys of the merged feed, newest first. Ties on `created_at` are broken
    /// by kind then id so slices are stable across calls.
    pub async fn feed_slice(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FeedKey>> {
        let rows = sqlx::query(
            r#"
            SELECT kind, id, created_at FROM (
                SELECT 'text' AS kind, CAST(id AS TEXT) AS id, id AS seq, created_at
                FROM text_messages WHERE conversation_id = ? AND is_deleted = 0
                UNION ALL
                SELECT 'image' AS kind, CAST(id AS TEXT) AS id, id AS seq, created_at
                FROM image_messages WHERE conversation_id = ? AND is_deleted = 0
                UNION ALL
                SELECT 'parameter' AS kind, id, 0 AS seq, created_at
                FROM machine_parameters WHERE conversation_id = ?
            )
            ORDER BY created_at DESC, kind ASC, seq DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(conversation_id)
        .bind(conversation_id)
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<FeedKey> {
                let kind: String = r.try_get("kind")?;
                Ok(FeedKey {
                    kind: FeedKind::from_column(&kind)?,
                    id: r.try_get("id")?,
                })
            })
            .collect()
    }
}

fn sender_column(row: &SqliteRow) -> Result<Sender> {
    let raw: String = row.try_get("sender")?;
    Ok(raw.parse()?)
}

fn timestamp_column(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: i64 = row.try_get(column)?;
    Ok(from_micros(raw))
}

/// Unreadable or absent arrays decode as empty.
fn steps_column(row: &SqliteRow, column: &str) -> Vec<f64> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        title: row.try_get("title")?,
        kind: row.try_get("type")?,
        user_id: row.try_get("user_id")?,
        is_deleted: row.try_get("is_deleted")?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

fn text_message_from_row(row: &SqliteRow) -> Result<TextMessage> {
    Ok(TextMessage {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        text: row.try_get("text")?,
        sender: sender_column(row)?,
        machine_model: row.try_get("machine_model")?,
        is_deleted: row.try_get("is_deleted")?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

fn image_message_from_row(row: &SqliteRow) -> Result<ImageMessage> {
    Ok(ImageMessage {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        image_url: row.try_get("image_url")?,
        image_key: row.try_get("image_key")?,
        metadata: row.try_get("metadata")?,
        top_k: row.try_get("top_k")?,
        sender: sender_column(row)?,
        machine_model: row.try_get("machine_model")?,
        is_deleted: row.try_get("is_deleted")?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

fn machine_from_row(row: &SqliteRow) -> Result<Machine> {
    Ok(Machine {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        number: row.try_get("number")?,
        kind: row.try_get("type")?,
        manufacturer: row.try_get("manufacturer")?,
        production_year: row.try_get("production_year")?,
        expiration_year: row.try_get("expiration_year")?,
        clamping_force: row.try_get("clamping_force")?,
        screw_diameter: row.try_get("screw_diameter")?,
        screw_stroke: row.try_get("screw_stroke")?,
        shot_volume: row.try_get("shot_volume")?,
        max_sys_pressure: row.try_get("max_sys_pressure")?,
        injection_pressure: row.try_get("injection_pressure")?,
        company_id: row.try_get("company_id")?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

fn material_from_row(row: &SqliteRow) -> Result<Material> {
    Ok(Material {
        id: row.try_get("id")?,
        kind: row.try_get("type")?,
        melt_density: row.try_get("melt_density")?,
        quantity: row.try_get("quantity")?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

fn parameter_from_row(row: &SqliteRow) -> Result<MachineParameter> {
    let recipe = Recipe {
        injection_temperature: steps_column(row, "injection_temperature"),
        position: steps_column(row, "position"),
        injection_pressure: steps_column(row, "injection_pressure"),
        velocity: steps_column(row, "velocity"),
        hold_pressure: steps_column(row, "hold_pressure"),
        hold_velocity: steps_column(row, "hold_velocity"),
        hold_time: steps_column(row, "hold_time"),
        back_pressure: steps_column(row, "back_pressure"),
        mold_temperature: row.try_get("mold_temperature")?,
        cooling_time: row.try_get("cooling_time")?,
        hot_runner_temperature: row.try_get("hot_runner_temperature")?,
        decompression: row.try_get("decompression")?,
        clamping_force: row.try_get("clamping_force")?,
        injection_weight: row.try_get("injection_weight")?,
        num_cavities: row.try_get("num_cavities")?,
        single_product_weight: row.try_get("single_product_weight")?,
        nozzle_weight: row.try_get("nozzle_weight")?,
        clamping_pressure: row.try_get("clamping_pressure")?,
    };

    Ok(MachineParameter {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        recipe,
        material_id: row.try_get("material_id")?,
        machine_id: row.try_get("machine_id")?,
        conversation_id: row.try_get("conversation_id")?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

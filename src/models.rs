use crate::constants::MAX_RECIPE_STEPS;
use crate::types::{RelayError, Result, Sender};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MICROS_PER_MINUTE: i64 = 60_000_000;

/// Storage form of a timestamp.
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

/// Truncates a stored timestamp to the start of its minute.
pub fn minute_floor_micros(us: i64) -> i64 {
    us - us.rem_euclid(MICROS_PER_MINUTE)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: String,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewConversation {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextMessage {
    pub id: i64,
    pub conversation_id: String,
    pub text: String,
    pub sender: Sender,
    pub machine_model: Option<String>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTextMessage {
    pub text: String,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub machine_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageMessage {
    pub id: i64,
    pub conversation_id: String,
    pub image_url: Option<String>,
    pub image_key: Option<String>,
    pub metadata: Option<String>,
    pub top_k: Option<i64>,
    pub sender: Sender,
    pub machine_model: Option<String>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageMessage {
    /// Description part of `description:<d>|utility:<u>` metadata, or "" when
    /// the metadata does not follow that convention.
    pub fn description(&self) -> String {
        self.metadata
            .as_deref()
            .and_then(ImageMetadata::parse)
            .map(|m| m.description)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewImageMessage {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_key: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub machine_model: Option<String>,
}

/// The `description:<d>|utility:<u>` convention used in image metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageMetadata {
    pub description: String,
    pub utility: String,
}

impl ImageMetadata {
    pub fn new(description: Option<&str>, utility: Option<&str>) -> Self {
        Self {
            description: description.unwrap_or_default().to_string(),
            utility: utility.unwrap_or_default().to_string(),
        }
    }

    pub fn encode(&self) -> String {
        format!("description:{}|utility:{}", self.description, self.utility)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        if !raw.starts_with("description") {
            return None;
        }
        let mut parts = raw.splitn(2, '|');
        let description = parts
            .next()
            .and_then(|p| p.split_once(':'))
            .map(|(_, v)| v.to_string())
            .unwrap_or_default();
        let utility = parts
            .next()
            .and_then(|p| p.split_once(':'))
            .map(|(_, v)| v.to_string())
            .unwrap_or_default();
        Some(Self {
            description,
            utility,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub number: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub manufacturer: String,
    pub production_year: Option<i64>,
    pub expiration_year: Option<i64>,
    pub clamping_force: f64,
    pub screw_diameter: f64,
    pub screw_stroke: f64,
    pub shot_volume: f64,
    pub max_sys_pressure: f64,
    pub injection_pressure: f64,
    pub company_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMachine {
    pub name: String,
    pub number: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub production_year: Option<i64>,
    #[serde(default)]
    pub expiration_year: Option<i64>,
    #[serde(default)]
    pub clamping_force: f64,
    #[serde(default)]
    pub screw_diameter: f64,
    #[serde(default)]
    pub screw_stroke: f64,
    #[serde(default)]
    pub shot_volume: f64,
    #[serde(default)]
    pub max_sys_pressure: f64,
    #[serde(default)]
    pub injection_pressure: f64,
    #[serde(default)]
    pub company_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Material {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub melt_density: f64,
    pub quantity: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMaterial {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub melt_density: f64,
    #[serde(default)]
    pub quantity: f64,
}

/// Injection recipe: eight staged profiles plus scalar settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Recipe {
    pub injection_temperature: Vec<f64>,
    pub position: Vec<f64>,
    pub injection_pressure: Vec<f64>,
    pub velocity: Vec<f64>,
    pub hold_pressure: Vec<f64>,
    pub hold_velocity: Vec<f64>,
    pub hold_time: Vec<f64>,
    pub back_pressure: Vec<f64>,
    pub mold_temperature: f64,
    pub cooling_time: f64,
    pub hot_runner_temperature: f64,
    pub decompression: f64,
    pub clamping_force: f64,
    pub injection_weight: f64,
    pub num_cavities: f64,
    pub single_product_weight: f64,
    pub nozzle_weight: f64,
    pub clamping_pressure: f64,
}

impl Recipe {
    pub fn staged(&self) -> [(&'static str, &Vec<f64>); 8] {
        [
            ("injection_temperature", &self.injection_temperature),
            ("position", &self.position),
            ("injection_pressure", &self.injection_pressure),
            ("velocity", &self.velocity),
            ("hold_pressure", &self.hold_pressure),
            ("hold_velocity", &self.hold_velocity),
            ("hold_time", &self.hold_time),
            ("back_pressure", &self.back_pressure),
        ]
    }

    pub fn scalars(&self) -> [(&'static str, f64); 10] {
        [
            ("mold_temperature", self.mold_temperature),
            ("cooling_time", self.cooling_time),
            ("hot_runner_temperature", self.hot_runner_temperature),
            ("decompression", self.decompression),
            ("clamping_force", self.clamping_force),
            ("injection_weight", self.injection_weight),
            ("num_cavities", self.num_cavities),
            ("single_product_weight", self.single_product_weight),
            ("nozzle_weight", self.nozzle_weight),
            ("clamping_pressure", self.clamping_pressure),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        for (name, values) in self.staged() {
            if values.len() > MAX_RECIPE_STEPS {
                return Err(RelayError::Validation(format!(
                    "{} holds {} values, at most {} allowed",
                    name,
                    values.len(),
                    MAX_RECIPE_STEPS
                ))
                .into());
            }
            if values.iter().any(|v| !v.is_finite()) {
                return Err(RelayError::Validation(format!("{} must be numeric", name)).into());
            }
        }
        for (name, value) in self.scalars() {
            if !value.is_finite() {
                return Err(RelayError::Validation(format!("{} must be numeric", name)).into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineParameter {
    pub id: String,
    pub title: Option<String>,
    #[serde(flatten)]
    pub recipe: Recipe,
    pub material_id: Option<String>,
    pub machine_id: Option<String>,
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MachineParameter {
    pub fn snapshot(&self) -> ParameterSnapshot {
        ParameterSnapshot {
            recipe: self.recipe.clone(),
            machine_id: self.machine_id.clone().unwrap_or_default(),
            material_id: self.material_id.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMachineParameter {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(flatten)]
    pub recipe: Recipe,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub material_id: Option<String>,
}

/// Recipe as exposed in history feeds; dangling references render as "".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSnapshot {
    #[serde(flatten)]
    pub recipe: Recipe,
    pub machine_id: String,
    pub material_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_convention_parses_both_parts() {
        let meta = ImageMetadata::parse("description:gate blush|utility:troubleshooting");
        assert_eq!(
            meta,
            Some(ImageMetadata {
                description: "gate blush".into(),
                utility: "troubleshooting".into()
            })
        );
        assert_eq!(ImageMetadata::parse("just a note"), None);
    }

    #[test]
    fn metadata_keeps_colons_inside_description() {
        let meta = ImageMetadata::new(Some("ratio 1:2"), None).encode();
        assert_eq!(meta, "description:ratio 1:2|utility:");
        let parsed = ImageMetadata::parse(&meta).map(|m| m.description);
        assert_eq!(parsed.as_deref(), Some("ratio 1:2"));
    }

    #[test]
    fn minute_floor_drops_seconds() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T10:15:42.123Z")
            .map(|d| d.with_timezone(&Utc))
            .unwrap();
        let floored = from_micros(minute_floor_micros(to_micros(ts)));
        assert_eq!(floored.to_rfc3339(), "2024-05-01T10:15:00+00:00");
    }

    #[test]
    fn recipe_rejects_more_than_eight_steps() {
        let recipe = Recipe {
            velocity: vec![1.0; 9],
            ..Recipe::default()
        };
        assert!(recipe.validate().is_err());
        assert!(Recipe::default().validate().is_ok());
    }
}

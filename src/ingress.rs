//! Client payload validation and construction of the bodies sent to the agent.

use crate::constants::DEFAULT_MACHINE_TYPE;
use crate::history::ContextEntry;
use crate::models::{Machine, MachineParameter, Material};
use crate::types::{RelayError, Result};
use serde::{Deserialize, Serialize};

/// The user's question, already saved as a text message.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TextQuery {
    pub id: i64,
    pub text: String,
}

/// The user's image, already saved as an image message.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ImageQueryRef {
    pub id: i64,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatIngress {
    #[serde(default)]
    pub text_query: Option<TextQuery>,
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub image_query: Option<ImageQueryRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsIngress {
    #[serde(default)]
    pub text_query: Option<TextQuery>,
    #[serde(default)]
    pub parameter_id: Option<String>,
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub image_query: Option<ImageQueryRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub text_query: TextQuery,
    pub machine_type: String,
    pub image_query: Option<ImageQueryRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpsTurn {
    pub text_query: TextQuery,
    pub parameter_id: String,
    pub machine_type: String,
    pub image_query: Option<ImageQueryRef>,
}

fn require_text(text_query: Option<TextQuery>) -> Result<TextQuery> {
    match text_query {
        Some(q) if !q.text.trim().is_empty() => Ok(q),
        Some(_) => Err(RelayError::Validation("textQuery.text must not be empty".to_string()).into()),
        None => Err(RelayError::Validation("textQuery is required".to_string()).into()),
    }
}

fn machine_type_or_default(machine_type: Option<String>) -> String {
    machine_type
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MACHINE_TYPE.to_string())
}

impl ChatIngress {
    pub fn validate(self) -> Result<ChatTurn> {
        Ok(ChatTurn {
            text_query: require_text(self.text_query)?,
            machine_type: machine_type_or_default(self.machine_type),
            image_query: self.image_query,
        })
    }
}

impl OpsIngress {
    pub fn validate(self) -> Result<OpsTurn> {
        let text_query = require_text(self.text_query)?;
        let parameter_id = match self.parameter_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(RelayError::Validation("parameterId is required".to_string()).into())
            }
        };
        Ok(OpsTurn {
            text_query,
            parameter_id,
            machine_type: machine_type_or_default(self.machine_type),
            image_query: self.image_query,
        })
    }
}

/// Object-store location the agent reads images from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

/// Splits `https://<bucket>.s3.amazonaws.com/<key>` into bucket and key.
/// Anything that is not an https URL yields `None`.
pub fn split_s3_url(url: &str) -> Option<S3Location> {
    let rest = url.strip_prefix("https://")?;
    let (host, key) = rest.split_once('/')?;
    let bucket = host.replace(".s3.amazonaws.com", "");
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some(S3Location {
        bucket,
        key: key.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub text_query: String,
    pub image_query: Option<S3Location>,
    pub machine_type: String,
    pub chat_history: Vec<ContextEntry>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InitParameters {
    pub material_name: String,
    pub machine_name: String,
    pub f_mouliste: f64,
    pub number_of_cavities: f64,
    pub product_weight: f64,
    pub nozzle_weight: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FinetunableParameters {
    pub injection_temperature: Vec<f64>,
    pub position: Vec<f64>,
    pub injection_pressure: Vec<f64>,
    pub velocity: Vec<f64>,
    pub mold_temperature: f64,
    pub cooling_time: f64,
    pub hot_runner_temperature: f64,
    pub decompression: f64,
    pub injected_weight: f64,
    pub clamping_force: f64,
    pub hold_pressure: Vec<f64>,
    pub hold_velocity: Vec<f64>,
    pub hold_time: Vec<f64>,
    pub back_pressure: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestBody {
    pub init_parameters: InitParameters,
    pub finetunable_parameters: FinetunableParameters,
    pub eng_feedback: String,
    pub chat_history: Vec<ContextEntry>,
}

pub fn build_chat_body(turn: &ChatTurn, chat_history: Vec<ContextEntry>) -> ChatRequestBody {
    let image_query = turn
        .image_query
        .as_ref()
        .and_then(|q| q.image_url.as_deref())
        .and_then(split_s3_url);

    ChatRequestBody {
        text_query: turn.text_query.text.clone(),
        image_query,
        machine_type: turn.machine_type.clone(),
        chat_history,
    }
}

/// Builds the ops body from a stored recipe. The recipe must reference a
/// machine and a material and every staged profile must hold a value.
pub fn build_ops_body(
    turn: &OpsTurn,
    parameter: &MachineParameter,
    machine: Option<&Machine>,
    material: Option<&Material>,
    chat_history: Vec<ContextEntry>,
) -> Result<OpsRequestBody> {
    let (machine, material) = match (machine, material) {
        (Some(machine), Some(material)) => (machine, material),
        _ => return Err(incomplete("initial")),
    };

    let recipe = &parameter.recipe;
    if recipe.staged().iter().any(|(_, steps)| steps.is_empty()) {
        return Err(incomplete("fine lists"));
    }
    if recipe.validate().is_err() {
        return Err(incomplete("fine floats"));
    }

    Ok(OpsRequestBody {
        init_parameters: InitParameters {
            material_name: material.kind.clone(),
            machine_name: machine.name.clone(),
            f_mouliste: recipe.clamping_pressure,
            number_of_cavities: recipe.num_cavities,
            product_weight: recipe.single_product_weight,
            nozzle_weight: recipe.nozzle_weight,
        },
        finetunable_parameters: FinetunableParameters {
            injection_temperature: recipe.injection_temperature.clone(),
            position: recipe.position.clone(),
            injection_pressure: recipe.injection_pressure.clone(),
            velocity: recipe.velocity.clone(),
            mold_temperature: recipe.mold_temperature,
            cooling_time: recipe.cooling_time,
            hot_runner_temperature: recipe.hot_runner_temperature,
            decompression: recipe.decompression,
            injected_weight: recipe.injection_weight,
            clamping_force: recipe.clamping_force,
            hold_pressure: recipe.hold_pressure.clone(),
            hold_velocity: recipe.hold_velocity.clone(),
            hold_time: recipe.hold_time.clone(),
            back_pressure: recipe.back_pressure.clone(),
        },
        eng_feedback: turn.text_query.text.clone(),
        chat_history,
    })
}

fn incomplete(group: &str) -> crate::types::ObservedError {
    RelayError::Validation(format!("Parameters must be updated correctly: {}", group)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Recipe;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn s3_urls_split_into_bucket_and_key() {
        assert_eq!(
            split_s3_url("https://zbot-input.s3.amazonaws.com/uploads/a/b.png"),
            Some(S3Location {
                bucket: "zbot-input".into(),
                key: "uploads/a/b.png".into()
            })
        );
        assert_eq!(split_s3_url("s3://bucket/key"), None);
        assert_eq!(split_s3_url("https://bucket.s3.amazonaws.com"), None);
    }

    #[test]
    fn chat_ingress_requires_text() {
        let missing: ChatIngress = serde_json::from_value(json!({"machineType": "X"})).unwrap();
        assert!(missing.validate().is_err());

        let blank: ChatIngress =
            serde_json::from_value(json!({"textQuery": {"id": 1, "text": "  "}})).unwrap();
        assert!(blank.validate().is_err());

        let ok: ChatIngress = serde_json::from_value(json!({
            "textQuery": {"id": 7, "text": "short shots on cavity 2"},
            "imageQuery": {"id": 3, "image_url": "https://b.s3.amazonaws.com/k.png"}
        }))
        .unwrap();
        let turn = ok.validate().unwrap();
        assert_eq!(turn.machine_type, DEFAULT_MACHINE_TYPE);

        let body = serde_json::to_value(build_chat_body(&turn, Vec::new())).unwrap();
        assert_eq!(body["textQuery"], "short shots on cavity 2");
        assert_eq!(body["imageQuery"], json!({"bucket": "b", "key": "k.png"}));
        assert_eq!(body["chatHistory"], json!([]));
    }

    fn parameter(recipe: Recipe) -> MachineParameter {
        MachineParameter {
            id: "p1".into(),
            title: Some("baseline".into()),
            recipe,
            material_id: Some("mat".into()),
            machine_id: Some("mac".into()),
            conversation_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn full_recipe() -> Recipe {
        Recipe {
            injection_temperature: vec![230.0, 235.0],
            position: vec![40.0],
            injection_pressure: vec![900.0],
            velocity: vec![60.0],
            hold_pressure: vec![500.0],
            hold_velocity: vec![20.0],
            hold_time: vec![3.0],
            back_pressure: vec![10.0],
            clamping_pressure: 80.0,
            num_cavities: 2.0,
            single_product_weight: 50.0,
            nozzle_weight: 5.0,
            injection_weight: 105.0,
            ..Recipe::default()
        }
    }

    fn machine() -> Machine {
        Machine {
            id: "mac".into(),
            name: "UN160".into(),
            number: "M-1".into(),
            kind: String::new(),
            manufacturer: String::new(),
            production_year: None,
            expiration_year: None,
            clamping_force: 4600.0,
            screw_diameter: 40.0,
            screw_stroke: 200.0,
            shot_volume: 500.0,
            max_sys_pressure: 150.0,
            injection_pressure: 0.0,
            company_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn material() -> Material {
        Material {
            id: "mat".into(),
            kind: "PP".into(),
            melt_density: 0.92,
            quantity: 0.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn turn() -> OpsTurn {
        OpsTurn {
            text_query: TextQuery {
                id: 1,
                text: "flash on parting line".into(),
            },
            parameter_id: "p1".into(),
            machine_type: DEFAULT_MACHINE_TYPE.into(),
            image_query: None,
        }
    }

    #[test]
    fn ops_body_maps_recipe_fields() {
        let body = build_ops_body(
            &turn(),
            &parameter(full_recipe()),
            Some(&machine()),
            Some(&material()),
            Vec::new(),
        )
        .unwrap();
        let v = serde_json::to_value(body).unwrap();
        assert_eq!(v["initParameters"]["machine_name"], "UN160");
        assert_eq!(v["initParameters"]["material_name"], "PP");
        assert_eq!(v["initParameters"]["f_mouliste"], 80.0);
        assert_eq!(v["finetunableParameters"]["injected_weight"], 105.0);
        assert_eq!(v["finetunableParameters"]["injection_temperature"], json!([230.0, 235.0]));
        assert_eq!(v["engFeedback"], "flash on parting line");
    }

    #[test]
    fn ops_body_rejects_incomplete_recipes() {
        let no_machine = build_ops_body(&turn(), &parameter(full_recipe()), None, Some(&material()), Vec::new());
        assert!(matches!(no_machine, Err(e) if e.inner.to_string().contains("initial")));

        let mut recipe = full_recipe();
        recipe.hold_time.clear();
        let empty_list = build_ops_body(&turn(), &parameter(recipe), Some(&machine()), Some(&material()), Vec::new());
        assert!(matches!(empty_list, Err(e) if e.inner.to_string().contains("fine lists")));
    }
}

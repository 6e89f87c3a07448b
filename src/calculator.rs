use crate::models::{Machine, Material};
use crate::types::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Process inputs the operator types in alongside a machine and material.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalculationInput {
    pub product_weight: Option<f64>,
    pub num_of_cavities: Option<f64>,
    pub nozzle_weight: Option<f64>,
    pub clamping_pressure: Option<f64>,
    pub machine_id: Option<String>,
    pub material_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalculatedParameters {
    pub injected_weight: f64,
    pub clamping_force_bar: f64,
}

/// Machine geometry the formula reads, lifted out of [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineSpec {
    pub screw_diameter: f64,
    pub screw_stroke: f64,
    pub shot_volume: f64,
    pub max_sys_pressure: f64,
    pub clamping_force: f64,
}

impl From<&Machine> for MachineSpec {
    fn from(m: &Machine) -> Self {
        Self {
            screw_diameter: m.screw_diameter,
            screw_stroke: m.screw_stroke,
            shot_volume: m.shot_volume,
            max_sys_pressure: m.max_sys_pressure,
            clamping_force: m.clamping_force,
        }
    }
}

/// Derives injected weight and clamping force in bar from machine geometry,
/// melt density and the operator's process inputs. Pure; never returns a
/// non-finite value.
pub fn calculate(
    machine: Option<&MachineSpec>,
    melt_density: Option<f64>,
    single_product_weight: Option<f64>,
    num_cavities: Option<f64>,
    nozzle_weight: Option<f64>,
    clamping_pressure: Option<f64>,
) -> Result<CalculatedParameters> {
    let machine = required(machine, "machine")?;
    let melt_density = required(melt_density, "material melt density")?;
    let single_product_weight = required(single_product_weight, "product_weight")?;
    let num_cavities = required(num_cavities, "num_of_cavities")?;
    let nozzle_weight = required(nozzle_weight, "nozzle_weight")?;
    let clamping_pressure = required(clamping_pressure, "clamping_pressure")?;

    let radius = machine.screw_diameter / 2.0;
    let cross_area = PI * radius * radius;
    nonzero(cross_area, "screw cross-section area")?;

    let shot_volume = (cross_area * machine.screw_stroke) / 1000.0;
    let shot_weight = shot_volume * melt_density;
    nonzero(shot_weight, "shot weight")?;

    let injected_weight_raw = single_product_weight * num_cavities + nozzle_weight;
    let injected_volume = (injected_weight_raw * machine.shot_volume) / shot_weight;
    let injected_weight = (injected_volume / cross_area) * 1000.0;

    nonzero(machine.clamping_force, "machine clamping force")?;
    let clamping_force_bar =
        (clamping_pressure * machine.max_sys_pressure * 10.0) / machine.clamping_force;

    finite(injected_weight, "injected weight")?;
    finite(clamping_force_bar, "clamping force")?;

    Ok(CalculatedParameters {
        injected_weight,
        clamping_force_bar,
    })
}

/// Convenience wrapper over stored reference records.
pub fn calculate_for(
    machine: Option<&Machine>,
    material: Option<&Material>,
    input: &CalculationInput,
) -> Result<CalculatedParameters> {
    let spec = machine.map(MachineSpec::from);
    calculate(
        spec.as_ref(),
        material.map(|m| m.melt_density),
        input.product_weight,
        input.num_of_cavities,
        input.nozzle_weight,
        input.clamping_pressure,
    )
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    match value {
        Some(v) => Ok(v),
        None => Err(RelayError::Validation(format!("Missing required parameter: {}", name)).into()),
    }
}

fn nonzero(value: f64, name: &str) -> Result<()> {
    if value == 0.0 || !value.is_finite() {
        return Err(RelayError::Arithmetic(format!("{} must be non-zero", name)).into());
    }
    Ok(())
}

fn finite(value: f64, name: &str) -> Result<()> {
    if !value.is_finite() {
        return Err(RelayError::Arithmetic(format!("{} is not a finite number", name)).into());
    }
    Ok(())
}

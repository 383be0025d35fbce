//! Blueprint selection helpers shared by the population managers

use rand::seq::SliceRandom;
use rand::Rng;

use crate::core::error::{CaptureError, Result};
use crate::engine::{Blueprint, BlueprintLibrary};

/// Vehicle ids known to misbehave under autopilot
const UNSAFE_VEHICLE_SUFFIXES: [&str; 2] = ["isetta", "carlacola"];

/// Role attribute tagging vehicles driven by the autopilot
pub const AUTOPILOT_ROLE: &str = "autopilot";

/// Blueprints matching `pattern`; empty matches are an error
pub fn matching(library: &BlueprintLibrary, pattern: &str) -> Result<Vec<Blueprint>> {
    let found = library.filter(pattern);
    if found.is_empty() {
        return Err(CaptureError::NoBlueprints(pattern.to_string()));
    }
    Ok(found)
}

/// Keep only four-wheeled vehicles that are not on the problem list
pub fn safe_vehicles(blueprints: Vec<Blueprint>) -> Vec<Blueprint> {
    blueprints
        .into_iter()
        .filter(|bp| bp.attribute("number_of_wheels").and_then(|a| a.as_int()) == Some(4))
        .filter(|bp| !UNSAFE_VEHICLE_SUFFIXES.iter().any(|suffix| bp.id.ends_with(suffix)))
        .collect()
}

/// Pick a blueprint and give it a random recommended value for `keys`
pub fn choose_varied<R: Rng + ?Sized>(
    blueprints: &[Blueprint],
    keys: &[&str],
    rng: &mut R,
) -> Option<Blueprint> {
    let mut blueprint = blueprints.choose(rng)?.clone();
    for key in keys {
        let value = blueprint
            .attribute(key)
            .and_then(|a| a.recommended_values.choose(rng))
            .cloned();
        if let Some(value) = value {
            blueprint.set_attribute(key, value);
        }
    }
    Some(blueprint)
}

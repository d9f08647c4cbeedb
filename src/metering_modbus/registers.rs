use std::fs::File;
use std::io::prelude::*;
use log::info;
use serde::Deserialize;
use serde_yml;
use thiserror::Error;

use crate::metering_modbus::decode::DecodeRule;

/// Where a decoded value lands in the wire message: `index` selects one of
/// the group's decoded values, `code` is the stable wire key (e.g. NCH1).
#[derive(Clone, Debug, Deserialize)]
pub struct ChannelSpec {
    pub code: String,
    pub index: usize,
}

/// A named register range decoded together into one physical quantity family.
#[derive(Clone, Debug, Deserialize)]
pub struct MeasurementGroup {
    pub name: String,
    pub start: u16,
    pub count: u16,
    pub decode: DecodeRule,
    pub channels: Vec<ChannelSpec>,
}

/// Per-model register layout. One map may be shared by many meters.
#[derive(Clone, Deserialize)]
pub struct RegisterMap {
    pub manufacturer: String,
    pub model: String,
    pub groups: Vec<MeasurementGroup>,
}

#[derive(Debug, Error)]
#[error("register map has no group named {0}")]
pub struct UnknownGroup(pub String);

impl RegisterMap {
    pub fn group(&self, name: &str) -> Result<&MeasurementGroup, UnknownGroup> {
        return self
            .groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| UnknownGroup(name.to_string()));
    }
}

#[derive(Debug, Error)]
pub enum RegisterMapError {
    #[error("meter definition of {0} not found")]
    NotFound(String),
    #[error("unable to read meter definition: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse meter definition: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("meter definition of {0} has no measurement groups")]
    Empty(String),
}

pub fn parse_map(contents: &str) -> Result<RegisterMap, RegisterMapError> {
    let map: RegisterMap = serde_yml::from_str(contents)?;
    if map.groups.is_empty() {
        return Err(RegisterMapError::Empty(map.model));
    }
    return Ok(map);
}

/// Load a model's register map. User specified definitions are used first,
/// then the definitions shipped with the program.
pub fn load_register_map(model: &str) -> Result<RegisterMap, RegisterMapError> {
    let mut file = File::open(format!("config/meters/{}.yaml", model));
    if file.is_err() {
        file = File::open(format!("defs/meters/{}.yaml", model));
        if file.is_err() {
            return Err(RegisterMapError::NotFound(model.to_string()));
        }
        info!("Loading definition of {model}");
    } else {
        info!("Using user provided definition of {model}");
    }

    let mut contents = String::new();
    file.unwrap().read_to_string(&mut contents)?;
    return parse_map(&contents);
}

use serde::{Deserialize, Serialize};

use crate::config::RequestDefaults;
use crate::features::FlatQuery;

/// Query string of the predict endpoints. Every field is optional; numeric
/// fields are kept as text so a malformed value is reported by name.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PredictParams {
    pub street_name: Option<String>,
    pub floor_area: Option<String>,
    pub storey_range: Option<String>,
    pub lease_start: Option<String>,
    pub flat_type: Option<String>,
}

impl PredictParams {
    pub fn into_query(self, defaults: &RequestDefaults) -> Result<FlatQuery, String> {
        Ok(FlatQuery {
            street_name: self
                .street_name
                .unwrap_or_else(|| defaults.street_name.clone()),
            floor_area: parse_or("floor_area", self.floor_area, defaults.floor_area)?,
            storey_range: parse_or("storey_range", self.storey_range, defaults.storey_range)?,
            lease_start: parse_or("lease_start", self.lease_start, defaults.lease_start)?,
            flat_type: self.flat_type.unwrap_or_else(|| defaults.flat_type.clone()),
        })
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T, String> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|_| format!("{name} must be numeric, got {s:?}")),
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ReloadStatus {
    pub reloaded: bool,
    pub present_model: String,
    pub future_model: String,
}

//! Display units. Stored data is always meters/seconds; conversion happens only
//! when outputs are produced.

use serde::{Deserialize, Serialize};

const METERS_PER_MILE: f64 = 1609.344;
const FEET_PER_METER: f64 = 3.280_84;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    #[default]
    Mi,
    Km,
}

impl DistanceUnit {
    pub fn from_meters(&self, meters: f64) -> f64 {
        match self {
            DistanceUnit::Mi => meters / METERS_PER_MILE,
            DistanceUnit::Km => meters / 1000.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DistanceUnit::Mi => "mi",
            DistanceUnit::Km => "km",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationUnit {
    #[default]
    Ft,
    M,
}

impl ElevationUnit {
    pub fn from_meters(&self, meters: f64) -> f64 {
        match self {
            ElevationUnit::Ft => meters * FEET_PER_METER,
            ElevationUnit::M => meters,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ElevationUnit::Ft => "ft",
            ElevationUnit::M => "m",
        }
    }
}

/// Round to two decimals so serialized outputs stay stable.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_match_reference_values() {
        assert_eq!(round2(DistanceUnit::Mi.from_meters(1609.344)), 1.0);
        assert_eq!(round2(DistanceUnit::Km.from_meters(5000.0)), 5.0);
        assert_eq!(round2(ElevationUnit::Ft.from_meters(100.0)), 328.08);
        assert_eq!(ElevationUnit::M.from_meters(42.0), 42.0);
    }

    #[test]
    fn durations_format_compactly() {
        assert_eq!(format_duration(119.0), "1m");
        assert_eq!(format_duration(3900.0), "1h 05m");
        assert_eq!(format_duration(-3.0), "0m");
    }
}

//! Raw provider record -> canonical activity.
//!
//! Resolution order: type alias, exclusion, explicit group alias, built-in
//! table, featured-type filter, fallback bucket. The function is pure; the
//! same record and settings always produce the same group.

use serde::Serialize;
use sweaty_core::config::ActivitySettings;
use sweaty_core::{Activity, RawActivity};

pub const UNKNOWN_TYPE: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Listed in `activities.exclude_types`.
    Excluded,
    /// Not featured, no fallback bucket, and `include_all_types` is off.
    NotSelected,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Excluded => "excluded",
            DropReason::NotSelected => "not_selected",
        }
    }
}

/// A record intentionally left out of the store. Counted, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationDrop {
    pub reason: DropReason,
    pub raw_type: String,
}

/// Built-in grouping for provider type names. Keys are compared after
/// [`type_key`] folding, so `TrailRun`, `trail_running` and `Trail Run` all
/// land on the same entry.
const SMART_GROUPS: &[(&str, &str)] = &[
    ("run", "Run"),
    ("running", "Run"),
    ("trailrun", "Run"),
    ("trailrunning", "Run"),
    ("virtualrun", "Run"),
    ("treadmillrunning", "Run"),
    ("indoorrunning", "Run"),
    ("streetrunning", "Run"),
    ("trackrunning", "Run"),
    ("ultrarun", "Run"),
    ("ride", "Ride"),
    ("cycling", "Ride"),
    ("biking", "Ride"),
    ("roadbiking", "Ride"),
    ("gravelride", "Ride"),
    ("gravelcycling", "Ride"),
    ("mountainbikeride", "Ride"),
    ("mountainbiking", "Ride"),
    ("emountainbikeride", "Ride"),
    ("ebikeride", "Ride"),
    ("ebiking", "Ride"),
    ("virtualride", "Ride"),
    ("indoorcycling", "Ride"),
    ("cyclocross", "Ride"),
    ("handcycle", "Ride"),
    ("velomobile", "Ride"),
    ("walk", "Walk"),
    ("walking", "Walk"),
    ("casualwalking", "Walk"),
    ("speedwalking", "Walk"),
    ("hike", "Hike"),
    ("hiking", "Hike"),
    ("swim", "Swim"),
    ("swimming", "Swim"),
    ("lapswimming", "Swim"),
    ("openwaterswimming", "Swim"),
    ("weighttraining", "WeightTraining"),
    ("strengthtraining", "WeightTraining"),
    ("workout", "Workout"),
    ("hiit", "Workout"),
    ("crossfit", "Workout"),
    ("indoorcardio", "Workout"),
    ("elliptical", "Workout"),
    ("stairstepper", "Workout"),
    ("yoga", "Yoga"),
    ("pilates", "Yoga"),
    ("rowing", "Rowing"),
    ("indoorrowing", "Rowing"),
    ("virtualrow", "Rowing"),
    ("alpineski", "WinterSports"),
    ("backcountryski", "WinterSports"),
    ("nordicski", "WinterSports"),
    ("resortskiing", "WinterSports"),
    ("backcountryskiing", "WinterSports"),
    ("crosscountryclassicskiing", "WinterSports"),
    ("snowboard", "WinterSports"),
    ("resortsnowboarding", "WinterSports"),
    ("snowshoe", "WinterSports"),
    ("iceskate", "WinterSports"),
];

/// Fold a type name for comparison: ASCII lowercase, punctuation and
/// whitespace removed.
pub fn type_key(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub fn smart_group(type_name: &str) -> Option<&'static str> {
    let key = type_key(type_name);
    SMART_GROUPS
        .iter()
        .find(|(candidate, _)| *candidate == key)
        .map(|(_, group)| *group)
}

fn lookup<'a>(
    map: &'a std::collections::BTreeMap<String, String>,
    name: &str,
) -> Option<&'a String> {
    map.get(name).or_else(|| {
        let key = type_key(name);
        map.iter()
            .find(|(candidate, _)| type_key(candidate) == key)
            .map(|(_, value)| value)
    })
}

fn listed(list: &[String], names: &[&str]) -> bool {
    list.iter().any(|entry| {
        let entry = type_key(entry);
        names.iter().any(|name| type_key(name) == entry)
    })
}

pub fn normalize(
    raw: &RawActivity,
    settings: &ActivitySettings,
) -> Result<Activity, NormalizationDrop> {
    let raw_type = raw
        .sport_type
        .as_deref()
        .or(raw.activity_type.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(UNKNOWN_TYPE)
        .to_string();

    let canonical_type = lookup(&settings.type_aliases, &raw_type)
        .cloned()
        .unwrap_or_else(|| raw_type.clone());

    if listed(&settings.exclude_types, &[raw_type.as_str(), canonical_type.as_str()]) {
        return Err(NormalizationDrop {
            reason: DropReason::Excluded,
            raw_type,
        });
    }

    let group = match lookup(&settings.group_aliases, &canonical_type)
        .or_else(|| lookup(&settings.group_aliases, &raw_type))
    {
        Some(explicit) => explicit.clone(),
        None => {
            let resolved = smart_group(&canonical_type)
                .map(str::to_string)
                .unwrap_or_else(|| canonical_type.clone());
            let featured = settings.types.is_empty()
                || listed(&settings.types, &[resolved.as_str(), canonical_type.as_str()]);
            if featured {
                resolved
            } else if settings.group_other_types {
                settings.other_bucket.clone()
            } else if settings.include_all_types {
                resolved
            } else {
                return Err(NormalizationDrop {
                    reason: DropReason::NotSelected,
                    raw_type,
                });
            }
        }
    };

    Ok(Activity {
        source_id: raw.source_id.clone(),
        source: raw.source,
        start_time: raw.start_time,
        start_time_local: raw.start_time_local,
        name: raw.name.clone(),
        raw_type,
        canonical_type,
        group,
        distance: raw.distance.max(0.0),
        elevation_gain: raw.elevation_gain.max(0.0),
        duration: raw.duration.max(0.0),
        deleted: false,
    })
}

/// Re-run [`normalize`] on a stored record under the current settings, so a
/// settings change applies to history without re-fetching it.
pub fn renormalize(
    activity: &Activity,
    settings: &ActivitySettings,
) -> Result<Activity, NormalizationDrop> {
    let raw = RawActivity {
        source: activity.source,
        source_id: activity.source_id.clone(),
        start_time: activity.start_time,
        start_time_local: activity.start_time_local,
        sport_type: Some(activity.raw_type.clone()),
        activity_type: None,
        name: activity.name.clone(),
        distance: activity.distance,
        elevation_gain: activity.elevation_gain,
        duration: activity.duration,
    };
    normalize(&raw, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sweaty_core::Source;

    fn raw(sport_type: Option<&str>, activity_type: Option<&str>) -> RawActivity {
        RawActivity {
            source: Source::Strava,
            source_id: "1".into(),
            start_time: Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).single().unwrap(),
            start_time_local: None,
            sport_type: sport_type.map(str::to_string),
            activity_type: activity_type.map(str::to_string),
            name: None,
            distance: 1000.0,
            elevation_gain: 10.0,
            duration: 600.0,
        }
    }

    fn settings() -> ActivitySettings {
        ActivitySettings::default()
    }

    #[test]
    fn smart_table_folds_provider_spellings() {
        assert_eq!(smart_group("TrailRun"), Some("Run"));
        assert_eq!(smart_group("trail_running"), Some("Run"));
        assert_eq!(smart_group("Mountain Biking"), Some("Ride"));
        assert_eq!(smart_group("underwater_basket_weaving"), None);
    }

    #[test]
    fn sport_type_wins_over_legacy_type() {
        let activity = normalize(&raw(Some("GravelRide"), Some("Ride")), &settings()).unwrap();
        assert_eq!(activity.raw_type, "GravelRide");
        assert_eq!(activity.canonical_type, "GravelRide");
        assert_eq!(activity.group, "Ride");

        let fallback = normalize(&raw(None, Some("Walk")), &settings()).unwrap();
        assert_eq!(fallback.group, "Walk");

        let unknown = normalize(&raw(None, None), &settings()).unwrap();
        assert_eq!(unknown.raw_type, UNKNOWN_TYPE);
        assert_eq!(unknown.group, UNKNOWN_TYPE);
    }

    #[test]
    fn excluded_types_are_dropped_before_grouping() {
        let mut cfg = settings();
        cfg.exclude_types = vec!["Yoga".into()];
        let drop = normalize(&raw(Some("Yoga"), None), &cfg).unwrap_err();
        assert_eq!(drop.reason, DropReason::Excluded);

        // exclusion also sees the aliased name
        cfg.exclude_types = vec!["Commute".into()];
        cfg.type_aliases.insert("EBikeRide".into(), "Commute".into());
        let drop = normalize(&raw(Some("EBikeRide"), None), &cfg).unwrap_err();
        assert_eq!(drop.reason, DropReason::Excluded);
    }

    #[test]
    fn group_alias_overrides_smart_table() {
        let mut cfg = settings();
        cfg.group_aliases.insert("VirtualRide".into(), "Indoor".into());
        let activity = normalize(&raw(Some("VirtualRide"), None), &cfg).unwrap();
        assert_eq!(activity.group, "Indoor");

        cfg.type_aliases.insert("Velomobile".into(), "VirtualRide".into());
        let aliased = normalize(&raw(Some("Velomobile"), None), &cfg).unwrap();
        assert_eq!(aliased.canonical_type, "VirtualRide");
        assert_eq!(aliased.group, "Indoor");
    }

    #[test]
    fn unfeatured_types_fall_back_or_drop() {
        let mut cfg = settings();
        cfg.types = vec!["Run".into(), "Ride".into()];

        let run = normalize(&raw(Some("TrailRun"), None), &cfg).unwrap();
        assert_eq!(run.group, "Run");

        let other = normalize(&raw(Some("Kayaking"), None), &cfg).unwrap();
        assert_eq!(other.group, "OtherSports");

        cfg.group_other_types = false;
        let own = normalize(&raw(Some("Kayaking"), None), &cfg).unwrap();
        assert_eq!(own.group, "Kayaking");

        cfg.include_all_types = false;
        let drop = normalize(&raw(Some("Kayaking"), None), &cfg).unwrap_err();
        assert_eq!(drop.reason, DropReason::NotSelected);
    }

    #[test]
    fn grouping_is_deterministic_and_keeps_meters() {
        let record = raw(Some("Run"), None);
        let first = normalize(&record, &settings()).unwrap();
        let second = normalize(&record, &settings()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.distance, 1000.0);
        assert_eq!(first.elevation_gain, 10.0);
    }

    #[test]
    fn renormalize_follows_current_settings() {
        let stored = normalize(&raw(None, Some("Yoga")), &settings()).unwrap();
        assert_eq!(renormalize(&stored, &settings()).unwrap(), stored);

        let mut cfg = settings();
        cfg.group_aliases.insert("Yoga".into(), "Mobility".into());
        assert_eq!(renormalize(&stored, &cfg).unwrap().group, "Mobility");

        cfg.exclude_types = vec!["yoga".into()];
        assert_eq!(
            renormalize(&stored, &cfg).unwrap_err().reason,
            DropReason::Excluded
        );
    }
}

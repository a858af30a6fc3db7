//! Day buckets for the heatmap. Always regenerated from the full store.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use sweaty_core::config::{DayBoundary, UnitSettings};
use sweaty_core::units::{format_duration, round2, DistanceUnit, ElevationUnit};
use sweaty_core::{Activity, HeatmapDay, HeatmapSegment};

/// Fold activities into one [`HeatmapDay`] per calendar day.
///
/// Each distinct group on a day gets one segment of weight `1/N`, however
/// many activities or meters it holds. Segments are ordered by group name
/// and days by date, so unchanged input always yields identical output.
pub fn aggregate<'a, I>(activities: I, boundary: DayBoundary) -> Vec<HeatmapDay>
where
    I: IntoIterator<Item = &'a Activity>,
{
    let mut days: BTreeMap<NaiveDate, BTreeMap<&'a str, HeatmapSegment>> = BTreeMap::new();
    for activity in activities.into_iter().filter(|a| !a.deleted) {
        let segment = days
            .entry(activity.day(boundary))
            .or_default()
            .entry(activity.group.as_str())
            .or_insert_with(|| HeatmapSegment {
                group: activity.group.clone(),
                count: 0,
                duration: 0.0,
                distance: 0.0,
                elevation_gain: 0.0,
                weight: 0.0,
            });
        segment.count += 1;
        segment.duration += activity.duration;
        segment.distance += activity.distance;
        segment.elevation_gain += activity.elevation_gain;
    }

    days.into_iter()
        .map(|(date, groups)| {
            let weight = 1.0 / groups.len() as f64;
            let segments = groups
                .into_values()
                .map(|mut segment| {
                    segment.weight = weight;
                    segment
                })
                .collect();
            HeatmapDay { date, segments }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportUnits {
    pub distance: DistanceUnit,
    pub elevation: ElevationUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSegment {
    pub group: String,
    pub count: u32,
    /// Unrounded `1/N`; a day's weights sum to 1.
    pub weight: f64,
    pub distance: f64,
    pub elevation_gain: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportDay {
    pub date: NaiveDate,
    pub count: u32,
    pub distance: f64,
    pub elevation_gain: f64,
    pub duration: f64,
    pub duration_label: String,
    pub segments: Vec<ReportSegment>,
}

/// Presentation payload: day buckets with totals converted to display units.
///
/// Carries no timestamps so it is byte-identical across runs on unchanged data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapReport {
    pub units: ReportUnits,
    /// Activity count per group across all days.
    pub groups: BTreeMap<String, u32>,
    pub days: Vec<ReportDay>,
}

impl HeatmapReport {
    pub fn build(days: &[HeatmapDay], units: &UnitSettings) -> Self {
        let mut groups: BTreeMap<String, u32> = BTreeMap::new();
        let report_days = days
            .iter()
            .map(|day| {
                for segment in &day.segments {
                    *groups.entry(segment.group.clone()).or_default() += segment.count;
                }
                let duration: f64 = day.segments.iter().map(|s| s.duration).sum();
                ReportDay {
                    date: day.date,
                    count: day.activity_count(),
                    distance: round2(
                        units
                            .distance
                            .from_meters(day.segments.iter().map(|s| s.distance).sum()),
                    ),
                    elevation_gain: round2(
                        units
                            .elevation
                            .from_meters(day.segments.iter().map(|s| s.elevation_gain).sum()),
                    ),
                    duration: round2(duration),
                    duration_label: format_duration(duration),
                    segments: day
                        .segments
                        .iter()
                        .map(|s| ReportSegment {
                            group: s.group.clone(),
                            count: s.count,
                            weight: s.weight,
                            distance: round2(units.distance.from_meters(s.distance)),
                            elevation_gain: round2(units.elevation.from_meters(s.elevation_gain)),
                            duration: round2(s.duration),
                        })
                        .collect(),
                }
            })
            .collect();

        Self {
            units: ReportUnits {
                distance: units.distance,
                elevation: units.elevation,
            },
            groups,
            days: report_days,
        }
    }
}

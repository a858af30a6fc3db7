use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sweaty_core::{Activity, ActivityKey, Source};
use tracing::debug;

use crate::{read_json_if_exists, write_json_atomic};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    activities: Vec<Activity>,
}

/// Canonical activities keyed by `(source, source_id)`.
///
/// Mutations stay in memory until [`ActivityStore::save`] replaces the file.
#[derive(Debug)]
pub struct ActivityStore {
    path: PathBuf,
    records: BTreeMap<ActivityKey, Activity>,
    dirty: bool,
}

impl ActivityStore {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Load the store at `path`; a missing file is an empty store, a corrupt
    /// one is an error.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let Some(file) = read_json_if_exists::<StoreFile>(&path)
            .await
            .with_context(|| format!("activity store {} is unreadable", path.display()))?
        else {
            return Ok(Self::empty(path));
        };
        if file.version != STORE_VERSION {
            bail!(
                "activity store {} has unsupported version {}",
                path.display(),
                file.version
            );
        }

        let records = file
            .activities
            .into_iter()
            .map(|activity| (activity.key(), activity))
            .collect::<BTreeMap<_, _>>();
        debug!(path = %path.display(), activities = records.len(), "activity store loaded");
        Ok(Self {
            path,
            records,
            dirty: false,
        })
    }

    /// Insert or replace by key. A record seen again at the provider is live,
    /// so it loses any deletion mark.
    pub fn upsert(&mut self, mut activity: Activity) -> UpsertOutcome {
        activity.deleted = false;
        let key = activity.key();
        let outcome = match self.records.get(&key) {
            None => UpsertOutcome::Inserted,
            Some(existing) if *existing == activity => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };
        if outcome != UpsertOutcome::Unchanged {
            self.records.insert(key, activity);
            self.dirty = true;
        }
        outcome
    }

    /// Mark records of `source` that are not in `seen` as deleted.
    ///
    /// Only records starting at or after `scope_start` are considered, since
    /// older ones were never part of the scan. Returns how many records were
    /// newly marked.
    pub fn prune(
        &mut self,
        source: Source,
        seen: &HashSet<String>,
        scope_start: Option<DateTime<Utc>>,
    ) -> usize {
        let mut marked = 0;
        for activity in self.records.values_mut() {
            if activity.source != source || activity.deleted {
                continue;
            }
            if scope_start.is_some_and(|start| activity.start_time < start) {
                continue;
            }
            if !seen.contains(&activity.source_id) {
                activity.deleted = true;
                marked += 1;
            }
        }
        if marked > 0 {
            self.dirty = true;
        }
        marked
    }

    /// Run every record of `source` back through `derive`. `None` removes
    /// the record; otherwise the derived record replaces it with its
    /// deletion mark kept. Returns `(changed, removed)`.
    pub fn rederive<F>(&mut self, source: Source, mut derive: F) -> (usize, usize)
    where
        F: FnMut(&Activity) -> Option<Activity>,
    {
        let (mut changed, mut removed) = (0, 0);
        self.records.retain(|key, activity| {
            if key.source != source {
                return true;
            }
            match derive(activity) {
                None => {
                    removed += 1;
                    false
                }
                Some(mut next) => {
                    next.deleted = activity.deleted;
                    if next != *activity {
                        *activity = next;
                        changed += 1;
                    }
                    true
                }
            }
        });
        if changed + removed > 0 {
            self.dirty = true;
        }
        (changed, removed)
    }

    /// Drop every record of `source`, deletion-marked ones included.
    pub fn remove_source(&mut self, source: Source) -> usize {
        self.rederive(source, |_| None).1
    }

    /// Records in key order, optionally including deletion-marked ones.
    pub fn all(&self, include_deleted: bool) -> impl Iterator<Item = &Activity> + '_ {
        self.records
            .values()
            .filter(move |activity| include_deleted || !activity.deleted)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replace the file with the in-memory records. No-op while nothing
    /// changed since the last load or save.
    pub async fn save(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let file = StoreFile {
            version: STORE_VERSION,
            activities: self.records.values().cloned().collect(),
        };
        write_json_atomic(&self.path, &file).await?;
        self.dirty = false;
        debug!(path = %self.path.display(), activities = file.activities.len(), "activity store saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn activity(source: Source, id: &str, day: u32) -> Activity {
        Activity {
            source_id: id.to_string(),
            source,
            start_time: Utc.with_ymd_and_hms(2024, 4, day, 7, 0, 0).single().unwrap(),
            start_time_local: None,
            name: Some(format!("Activity {id}")),
            raw_type: "Run".into(),
            canonical_type: "Run".into(),
            group: "Run".into(),
            distance: 5000.0,
            elevation_gain: 40.0,
            duration: 1500.0,
            deleted: false,
        }
    }

    #[test]
    fn upsert_is_idempotent_per_key() {
        let mut store = ActivityStore::empty("unused.json");
        assert_eq!(
            store.upsert(activity(Source::Strava, "1", 1)),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(activity(Source::Strava, "1", 1)),
            UpsertOutcome::Unchanged
        );

        let mut renamed = activity(Source::Strava, "1", 1);
        renamed.name = Some("Renamed".into());
        assert_eq!(store.upsert(renamed), UpsertOutcome::Updated);

        assert_eq!(
            store.upsert(activity(Source::Garmin, "1", 1)),
            UpsertOutcome::Inserted
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn prune_respects_source_scope_and_seen_ids() {
        let mut store = ActivityStore::empty("unused.json");
        store.upsert(activity(Source::Strava, "old", 1));
        store.upsert(activity(Source::Strava, "kept", 10));
        store.upsert(activity(Source::Strava, "gone", 12));
        store.upsert(activity(Source::Garmin, "other", 12));

        let seen: HashSet<String> = ["kept".to_string()].into_iter().collect();
        let scope = Utc.with_ymd_and_hms(2024, 4, 5, 0, 0, 0).single();
        assert_eq!(store.prune(Source::Strava, &seen, scope), 1);
        assert_eq!(store.prune(Source::Strava, &seen, scope), 0);

        let live: Vec<&str> = store.all(false).map(|a| a.source_id.as_str()).collect();
        assert_eq!(live, vec!["kept", "old", "other"]);
        assert_eq!(store.all(true).count(), 4);
    }

    #[test]
    fn refetched_record_is_revived() {
        let mut store = ActivityStore::empty("unused.json");
        store.upsert(activity(Source::Strava, "9", 3));
        store.prune(Source::Strava, &HashSet::new(), None);
        assert_eq!(store.all(false).count(), 0);

        assert_eq!(
            store.upsert(activity(Source::Strava, "9", 3)),
            UpsertOutcome::Updated
        );
        assert_eq!(store.all(false).count(), 1);
    }

    #[tokio::test]
    async fn save_and_reopen_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("activities.json");

        let mut store = ActivityStore::open(&path).await.expect("open missing");
        assert!(store.is_empty());
        store.upsert(activity(Source::Garmin, "42", 2));
        store.save().await.expect("save");

        let reopened = ActivityStore::open(&path).await.expect("reopen");
        assert!(reopened.all(true).eq(store.all(true)));
    }

    #[tokio::test]
    async fn clean_store_skips_the_write() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("activities.json");

        let mut store = ActivityStore::open(&path).await.expect("open missing");
        store.save().await.expect("save clean");
        assert!(!path.exists());

        store.upsert(activity(Source::Strava, "1", 2));
        store.save().await.expect("save dirty");
        std::fs::write(&path, b"{ overwritten").unwrap();
        store.upsert(activity(Source::Strava, "1", 2));
        store.save().await.expect("save unchanged");
        assert_eq!(std::fs::read(&path).unwrap(), b"{ overwritten");
    }

    #[test]
    fn rederive_rewrites_or_removes_one_source() {
        let mut store = ActivityStore::empty("unused.json");
        store.upsert(activity(Source::Strava, "yoga", 1));
        store.upsert(activity(Source::Strava, "run", 2));
        store.upsert(activity(Source::Strava, "gone", 3));
        store.upsert(activity(Source::Garmin, "yoga", 1));
        store.prune(Source::Strava, &["yoga".to_string(), "run".to_string()].into_iter().collect(), None);

        let (changed, removed) = store.rederive(Source::Strava, |a| match a.source_id.as_str() {
            "yoga" => None,
            _ => {
                let mut next = a.clone();
                next.group = "Cardio".into();
                Some(next)
            }
        });
        assert_eq!((changed, removed), (2, 1));
        let left: Vec<(&str, &str, bool)> = store
            .all(true)
            .map(|a| (a.source_id.as_str(), a.group.as_str(), a.deleted))
            .collect();
        assert_eq!(
            left,
            vec![("gone", "Cardio", true), ("run", "Cardio", false), ("yoga", "Run", false)]
        );

        assert_eq!(store.remove_source(Source::Garmin), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_store_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("activities.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(ActivityStore::open(&path).await.is_err());
    }
}

use std::path::PathBuf;

use anyhow::Context;
use sweaty_core::{BackfillCursor, Source};
use tokio::fs;
use tracing::warn;

use crate::{read_json_if_exists, write_json_atomic};

/// One `backfill_state_<source>.json` per source inside the data directory.
#[derive(Debug, Clone)]
pub struct CursorStore {
    dir: PathBuf,
}

impl CursorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, source: Source) -> PathBuf {
        self.dir.join(format!("backfill_state_{source}.json"))
    }

    /// Never fails on content: a missing, corrupt or mismatched file yields a
    /// fresh cursor. The worst outcome is a full re-fetch.
    pub async fn load(&self, source: Source) -> BackfillCursor {
        let path = self.path_for(source);
        match read_json_if_exists::<BackfillCursor>(&path).await {
            Ok(Some(cursor)) if cursor.source == source => cursor,
            Ok(Some(cursor)) => {
                warn!(
                    path = %path.display(),
                    expected = %source,
                    found = %cursor.source,
                    "cursor belongs to another source; starting fresh"
                );
                BackfillCursor::fresh(source)
            }
            Ok(None) => BackfillCursor::fresh(source),
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "cursor unreadable; starting fresh");
                BackfillCursor::fresh(source)
            }
        }
    }

    pub async fn save(&self, cursor: &BackfillCursor) -> anyhow::Result<()> {
        write_json_atomic(&self.path_for(cursor.source), cursor).await
    }

    pub async fn reset(&self, source: Source) -> anyhow::Result<()> {
        let path = self.path_for(source);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

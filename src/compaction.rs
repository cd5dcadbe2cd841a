use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::Config;
use crate::db::Shared;
use crate::error::{Error, Result};
use crate::record::Entry;
use crate::segment::Segment;

/// Kicks off a background merge of the older segments, unless one is
/// already in flight. A trigger that loses the race is dropped; the next
/// rotation re-triggers, which also retries after a failed merge.
pub(crate) fn spawn(shared: Arc<Shared>, config: Config) {
    if shared.compaction_running.swap(true, Ordering::SeqCst) {
        return;
    }

    tokio::spawn(async move {
        let _guard = MergeGuard {
            shared: Arc::clone(&shared),
        };
        if let Err(error) = merge(&shared, &config) {
            tracing::warn!(%error, "compaction abandoned");
        }
    });
}

struct MergeGuard {
    shared: Arc<Shared>,
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        self.shared.compaction_running.store(false, Ordering::SeqCst);
    }
}

/// Consolidates every segment except the tail into one merged segment.
///
/// Candidates are walked oldest to newest; a key is skipped when a
/// strictly newer candidate also carries it, so each surviving key is
/// copied exactly once with its current value. The merged file is built
/// under a temporary name and renamed over the newest candidate's name,
/// keeping "oldest segment has the smallest number" true for the next
/// open. The tail is untouched throughout, so the writer never waits on
/// merge IO.
fn merge(shared: &Shared, config: &Config) -> Result<()> {
    if shared.shutdown.load(Ordering::SeqCst) {
        return Ok(());
    }

    let candidates: Vec<Arc<Segment>> = {
        let segments = shared.segments.read().unwrap();
        if segments.len() < config.min_compaction_segments {
            return Ok(());
        }
        segments[..segments.len() - 1].to_vec()
    };
    let target = match candidates.last() {
        Some(target) => target,
        None => return Ok(()),
    };

    let merged_id = target.id();
    let merged_path = target.path().to_path_buf();
    let tmp_path = merged_path.with_extension("tmp");

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut writer = BufWriter::new(file);

    let mut index = HashMap::new();
    let mut offset = 0u64;
    for (position, candidate) in candidates.iter().enumerate() {
        let newer = &candidates[position + 1..];
        for (key, key_offset) in candidate.entries() {
            if newer.iter().any(|segment| segment.has_key(&key)) {
                continue;
            }
            let value = candidate.read_value(key_offset)?;
            let record = Entry::new(key.clone(), value).encode();
            writer.write_all(&record)?;

            index.insert(key, offset);
            offset += record.len() as u64;
        }
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| Error::Io(e.to_string()))?;
    file.sync_all()?;
    fs::rename(&tmp_path, &merged_path)?;

    let records = index.len();
    let merged = Arc::new(Segment::from_parts(merged_id, merged_path, file, index));

    let replaced = candidates.len();
    {
        let mut segments = shared.segments.write().unwrap();
        segments.splice(..replaced, std::iter::once(Arc::clone(&merged)));
    }

    // The newest candidate's file just became the merged file; the rest
    // are garbage now. In-flight readers keep their open handles.
    for candidate in &candidates[..replaced - 1] {
        if let Err(error) = fs::remove_file(candidate.path()) {
            tracing::warn!(segment_id = candidate.id(), %error, "failed to unlink merged segment");
        }
    }

    tracing::info!(
        merged_id,
        replaced,
        records,
        bytes = offset,
        "merged older segments"
    );
    Ok(())
}

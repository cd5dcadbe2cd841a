use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::record::{Entry, LENGTH_PREFIX_SIZE};
use crate::segment::{parse_segment_id, Segment};

/// Result of scanning one data directory on open.
pub(crate) struct RecoveredDir {
    /// Pre-existing segments, oldest first.
    pub(crate) segments: Vec<Arc<Segment>>,
    /// First unused sequence number.
    pub(crate) next_id: u64,
}

/// Result of streaming one segment file front-to-back.
struct ScannedFile {
    index: HashMap<String, u64>,
    /// Byte offset just past the last fully decodable record.
    size: u64,
    /// Whether the scan stopped before end-of-file on a short or
    /// undecodable record.
    truncated: bool,
}

/// Rebuilds segment state from a data directory.
///
/// Segment files are ordered by the numeric suffix in their names; there
/// is no manifest. Each file is scanned front-to-back to rebuild its
/// key-to-offset map. A damaged tail is tolerated on the newest file only:
/// the file is truncated back to its last complete record and everything
/// before it stays readable. Damage in any older file aborts the open.
pub(crate) fn recover(dir: &Path) -> Result<RecoveredDir> {
    let mut found: Vec<(u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        // A crash mid-merge can leave a partially written segment behind.
        if name.starts_with(crate::segment::SEGMENT_FILE_PREFIX) && name.ends_with(".tmp") {
            tracing::warn!(file = %name, "removing stale merge artifact");
            fs::remove_file(entry.path())?;
            continue;
        }

        if let Some(id) = parse_segment_id(&name) {
            found.push((id, entry.path()));
        }
    }
    found.sort_by_key(|(id, _)| *id);

    let mut segments = Vec::with_capacity(found.len());
    let newest = found.len().saturating_sub(1);
    for (position, (id, path)) in found.iter().enumerate() {
        let scan = scan_file(path)?;
        if scan.truncated {
            if position != newest {
                return Err(Error::CorruptSegment(format!(
                    "segment {id} is damaged past offset {} but is not the newest segment",
                    scan.size
                )));
            }
            tracing::warn!(
                segment_id = id,
                valid_bytes = scan.size,
                "discarding truncated tail record"
            );
            truncate_file(path, scan.size)?;
        }
        segments.push(Arc::new(Segment::open(*id, path.clone(), scan.index)?));
    }

    let next_id = found.last().map(|(id, _)| id + 1).unwrap_or(0);
    tracing::info!(
        segments = segments.len(),
        next_segment_id = next_id,
        "recovered data directory"
    );
    Ok(RecoveredDir { segments, next_id })
}

/// Streams records out of one segment file, tracking the running offset of
/// each record explicitly.
fn scan_file(path: &Path) -> Result<ScannedFile> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut index = HashMap::new();
    let mut offset = 0u64;
    let mut truncated = false;

    loop {
        let mut record = vec![0u8; LENGTH_PREFIX_SIZE];
        match read_fill(&mut reader, &mut record)? {
            0 => break, // clean end of file
            n if n < LENGTH_PREFIX_SIZE => {
                truncated = true;
                break;
            }
            _ => {}
        }

        let total = LittleEndian::read_u32(&record) as usize;
        if total < LENGTH_PREFIX_SIZE {
            truncated = true;
            break;
        }

        record.resize(total, 0);
        let body = &mut record[LENGTH_PREFIX_SIZE..];
        if read_fill(&mut reader, body)? < body.len() {
            truncated = true;
            break;
        }

        let entry = match Entry::decode(&record) {
            Ok(entry) => entry,
            Err(_) => {
                truncated = true;
                break;
            }
        };

        index.insert(entry.key, offset);
        offset += total as u64;
    }

    Ok(ScannedFile {
        index,
        size: offset,
        truncated,
    })
}

/// Reads until `buf` is full or the stream ends, returning the byte count.
fn read_fill(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn truncate_file(path: &Path, size: u64) -> Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(size)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::segment_file_name;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_segment(dir: &Path, id: u64, entries: &[Entry]) -> PathBuf {
        let path = dir.join(segment_file_name(id));
        let mut file = File::create(&path).expect("Failed to create segment file");
        for entry in entries {
            file.write_all(&entry.encode())
                .expect("Failed to write record");
        }
        path
    }

    #[test]
    fn test_recover_empty_dir() {
        let dir = tempdir().expect("Failed to create temp dir");
        let recovered = recover(dir.path()).expect("Failed to recover");
        assert!(recovered.segments.is_empty());
        assert_eq!(recovered.next_id, 0);
    }

    #[test]
    fn test_recover_orders_by_numeric_suffix() {
        let dir = tempdir().expect("Failed to create temp dir");
        // Lexicographic order would put 10 before 2.
        write_segment(dir.path(), 10, &[Entry::new("key1", "newer")]);
        write_segment(dir.path(), 2, &[Entry::new("key1", "older")]);

        let recovered = recover(dir.path()).expect("Failed to recover");
        let ids: Vec<u64> = recovered.segments.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![2, 10]);
        assert_eq!(recovered.next_id, 11);
    }

    #[test]
    fn test_scan_rebuilds_offsets() {
        let dir = tempdir().expect("Failed to create temp dir");
        let entries = [
            Entry::new("key1", "value1"),
            Entry::new("key2", "value2"),
            Entry::new("key1", "value1-updated"),
        ];
        write_segment(dir.path(), 0, &entries);

        let recovered = recover(dir.path()).expect("Failed to recover");
        let segment = &recovered.segments[0];

        // The map points at the newest record for the rewritten key.
        let first_len = entries[0].encoded_len();
        let second_len = entries[1].encoded_len();
        assert_eq!(segment.offset_of("key2"), Some(first_len));
        assert_eq!(segment.offset_of("key1"), Some(first_len + second_len));
        assert_eq!(
            segment
                .read_value(first_len + second_len)
                .expect("Failed to read"),
            "value1-updated"
        );
    }

    #[test]
    fn test_truncated_tail_tolerated_on_newest() {
        let dir = tempdir().expect("Failed to create temp dir");
        let entries = [Entry::new("key1", "value1"), Entry::new("key2", "value2")];
        let path = write_segment(dir.path(), 0, &entries);

        // Chop the final record in half.
        let full = fs::metadata(&path).expect("Failed to stat").len();
        truncate_file(&path, full - 5).expect("Failed to truncate");

        let recovered = recover(dir.path()).expect("Open should tolerate a damaged tail");
        let segment = &recovered.segments[0];
        assert!(segment.has_key("key1"));
        assert!(!segment.has_key("key2"));

        // The damaged bytes are gone from disk as well.
        assert_eq!(
            fs::metadata(&path).expect("Failed to stat").len(),
            entries[0].encoded_len()
        );
    }

    #[test]
    fn test_damage_in_older_segment_is_fatal() {
        let dir = tempdir().expect("Failed to create temp dir");
        let older = write_segment(dir.path(), 0, &[Entry::new("key1", "value1")]);
        write_segment(dir.path(), 1, &[Entry::new("key2", "value2")]);

        let full = fs::metadata(&older).expect("Failed to stat").len();
        truncate_file(&older, full - 3).expect("Failed to truncate");

        let result = recover(dir.path());
        assert!(matches!(result, Err(Error::CorruptSegment(_))));
    }

    #[test]
    fn test_garbage_tail_tolerated_on_newest() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = write_segment(dir.path(), 0, &[Entry::new("key1", "value1")]);
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("Failed to open");
        // A plausible length prefix followed by bytes that do not decode.
        file.write_all(&[40, 0, 0, 0, 0xff, 0xff, 0xff, 0xff])
            .expect("Failed to write garbage");
        drop(file);

        let recovered = recover(dir.path()).expect("Open should tolerate trailing garbage");
        assert!(recovered.segments[0].has_key("key1"));
    }

    #[test]
    fn test_stale_merge_artifact_removed() {
        let dir = tempdir().expect("Failed to create temp dir");
        write_segment(dir.path(), 0, &[Entry::new("key1", "value1")]);
        let tmp = dir.path().join("current-data0.tmp");
        fs::write(&tmp, b"partial").expect("Failed to write tmp");

        let recovered = recover(dir.path()).expect("Failed to recover");
        assert_eq!(recovered.segments.len(), 1);
        assert!(!tmp.exists());
    }
}

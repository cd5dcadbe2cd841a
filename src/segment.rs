use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use byteorder::{ByteOrder, LittleEndian};

use crate::errcorrupt;
use crate::record::{Entry, LENGTH_PREFIX_SIZE};
use crate::error::Result;

/// Prefix shared by every segment file in a data directory.
pub const SEGMENT_FILE_PREFIX: &str = "current-data";

/// File name for the segment with the given sequence number.
pub(crate) fn segment_file_name(id: u64) -> String {
    format!("{SEGMENT_FILE_PREFIX}{id}")
}

/// Parses a segment sequence number back out of a file name.
pub(crate) fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_FILE_PREFIX)?.parse().ok()
}

/// One segment: an append-only file plus the in-memory map from key to the
/// byte offset of that key's most recent record within the file.
///
/// Only the active (tail) segment ever takes appends, and only through the
/// writer loop; its map is mutated only by the index loop. Every other
/// segment is immutable. The file handle is held open for the segment's
/// whole lifetime, so readers that raced a compaction swap keep reading
/// the original inode even after the path is reused or unlinked.
pub struct Segment {
    id: u64,
    path: PathBuf,
    file: File,
    index: RwLock<HashMap<String, u64>>,
}

impl Segment {
    /// Creates a fresh, empty segment file. Returns the segment and the
    /// append handle the writer loop takes ownership of.
    pub(crate) fn create(id: u64, path: PathBuf) -> Result<(Self, File)> {
        let file = open_active(&path)?;
        let segment = Self {
            id,
            path,
            file: file.try_clone()?,
            index: RwLock::new(HashMap::new()),
        };
        Ok((segment, file))
    }

    /// Opens a recovered segment read-only, with the map rebuilt by the
    /// recovery scan.
    pub(crate) fn open(id: u64, path: PathBuf, index: HashMap<String, u64>) -> Result<Self> {
        let file = File::open(&path)?;
        Ok(Self {
            id,
            path,
            file,
            index: RwLock::new(index),
        })
    }

    /// Wraps an already-built file and map, used by the merger for the
    /// segment it just produced.
    pub(crate) fn from_parts(
        id: u64,
        path: PathBuf,
        file: File,
        index: HashMap<String, u64>,
    ) -> Self {
        Self {
            id,
            path,
            file,
            index: RwLock::new(index),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this segment's map contains the key.
    pub fn has_key(&self, key: &str) -> bool {
        self.index.read().unwrap().contains_key(key)
    }

    pub(crate) fn offset_of(&self, key: &str) -> Option<u64> {
        self.index.read().unwrap().get(key).copied()
    }

    pub(crate) fn insert(&self, key: String, offset: u64) {
        self.index.write().unwrap().insert(key, offset);
    }

    /// Snapshot of the map, taken by the merger once the segment is
    /// immutable.
    pub(crate) fn entries(&self) -> Vec<(String, u64)> {
        self.index
            .read()
            .unwrap()
            .iter()
            .map(|(key, offset)| (key.clone(), *offset))
            .collect()
    }

    /// Reads the value of the record starting at `offset`: one positioned
    /// read for the length prefix, one for the full record, then decode.
    pub fn read_value(&self, offset: u64) -> Result<String> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        read_at(&self.file, &mut prefix, offset).map_err(at_offset(offset))?;

        let total = LittleEndian::read_u32(&prefix) as usize;
        if total < LENGTH_PREFIX_SIZE {
            return errcorrupt!("record length {total} below minimum at offset {offset}");
        }

        let mut record = vec![0u8; total];
        read_at(&self.file, &mut record, offset).map_err(at_offset(offset))?;

        Ok(Entry::decode(&record)?.value)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("keys", &self.index.read().unwrap().len())
            .finish()
    }
}

/// Opens an active segment file with create+append+read semantics, mode
/// 0644.
fn open_active(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true).read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options.open(path)
}

// A read past the end of the file means the offset or length field did not
// come from a complete record.
fn at_offset(offset: u64) -> impl Fn(io::Error) -> crate::Error {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            crate::Error::CorruptRecord(format!("record at offset {offset} extends past end of segment"))
        } else {
            crate::Error::Io(e.to_string())
        }
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        match file.seek_read(&mut buf[read..], offset + read as u64)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            n => read += n,
        }
    }
    Ok(())
}

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flock::DirLock;
use crate::index::{self, IndexCommand};
use crate::record::Entry;
use crate::recovery;
use crate::segment::{segment_file_name, Segment};
use crate::writer::{Writer, WriterCommand};

const CHANNEL_CAPACITY: usize = 64;

// Lifecycle states. `Opening` is the span of `open` itself and is never
// observable through a handle.
const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// State shared between the writer loop, the index loop, and the merger.
pub(crate) struct Shared {
    /// Segments oldest first; the last element is the active tail. The
    /// writer appends on rotation, the merger replaces a prefix, and the
    /// index loop scans it newest-first, all under this one lock.
    pub(crate) segments: RwLock<Vec<Arc<Segment>>>,
    pub(crate) next_segment_id: AtomicU64,
    pub(crate) compaction_running: AtomicBool,
    /// Set by `close`; a merge that has not started yet exits without
    /// touching the directory.
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn new(segments: Vec<Arc<Segment>>, next_segment_id: u64) -> Self {
        Self {
            segments: RwLock::new(segments),
            next_segment_id: AtomicU64::new(next_segment_id),
            compaction_running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }
}

/// An append-only, segmented key-value store.
///
/// One serialized writer task appends records to the active segment, one
/// serialized index task answers lookups, and a background merger
/// periodically consolidates the older segments. Callers of [`put`] and
/// [`get`] run in arbitrary tasks; reads are a single positioned read
/// against the relevant segment file.
///
/// A directory is owned by at most one `Database` at a time, enforced
/// with an advisory lock file.
///
/// [`put`]: Database::put
/// [`get`]: Database::get
pub struct Database {
    shared: Arc<Shared>,
    writer_tx: mpsc::Sender<WriterCommand>,
    index_tx: mpsc::Sender<IndexCommand>,
    state: AtomicU8,
    _lock: DirLock,
}

impl Database {
    /// Open a database directory with default configuration.
    pub async fn open(dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::open_with_config(Config::new(dir)).await
    }

    /// Open a database directory with custom configuration.
    ///
    /// Existing segment files are discovered and scanned to rebuild their
    /// key maps, then a fresh active segment is allocated and the writer
    /// and index loops start.
    pub async fn open_with_config(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = DirLock::acquire(&config.dir)?;

        let recovered = recovery::recover(&config.dir)?;
        let mut segments = recovered.segments;

        let active_id = recovered.next_id;
        let (active, file) =
            Segment::create(active_id, config.dir.join(segment_file_name(active_id)))?;
        let active = Arc::new(active);
        segments.push(Arc::clone(&active));

        let segment_count = segments.len();
        let shared = Arc::new(Shared::new(segments, active_id + 1));

        let (index_tx, index_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(index::run(Arc::clone(&shared), index_rx));

        let (writer_tx, writer_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = Writer::new(
            Arc::clone(&shared),
            config.clone(),
            index_tx.clone(),
            active,
            file,
        );
        tokio::spawn(writer.run(writer_rx));

        tracing::info!(
            dir = %config.dir.display(),
            segments = segment_count,
            "opened database"
        );

        Ok(Self {
            shared,
            writer_tx,
            index_tx,
            state: AtomicU8::new(STATE_OPEN),
            _lock: lock,
        })
    }

    /// Store a value under a key. Empty keys are rejected.
    ///
    /// The call returns once the record is in the active file's write
    /// stream and its index update is queued, so a subsequent [`get`]
    /// from any task observes it.
    ///
    /// [`get`]: Database::get
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must not be empty".to_string()));
        }

        let (reply, response) = oneshot::channel();
        let command = WriterCommand::Write {
            entry: Entry::new(key, value),
            reply,
        };
        if self.writer_tx.send(command).await.is_err() {
            return Err(Error::Closed);
        }
        response.await.map_err(|_| Error::Closed)?
    }

    /// Fetch the current value for a key.
    pub async fn get(&self, key: &str) -> Result<String> {
        self.ensure_open()?;

        let (reply, response) = oneshot::channel();
        let command = IndexCommand::Lookup {
            key: key.to_string(),
            reply,
        };
        if self.index_tx.send(command).await.is_err() {
            return Err(Error::Closed);
        }
        let location = response
            .await
            .map_err(|_| Error::Closed)?
            .ok_or(Error::NotFound)?;

        location.segment.read_value(location.offset)
    }

    /// Flush and close the active segment file. Every operation after
    /// this, including a second `close`, fails with [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Closed);
        }

        self.shared.shutdown.store(true, Ordering::SeqCst);

        let (reply, response) = oneshot::channel();
        let result = match self.writer_tx.send(WriterCommand::Shutdown { reply }).await {
            Ok(()) => response.await.map_err(|_| Error::Closed).and_then(|r| r),
            Err(_) => Err(Error::Closed),
        };

        // Let an in-flight merge finish before the directory can change
        // hands; a queued one sees the shutdown flag and exits.
        while self.shared.compaction_running.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        tracing::info!("closed database");
        result
    }

    /// Number of segments currently in the list, the active tail included.
    pub fn segment_count(&self) -> usize {
        self.shared.segments.read().unwrap().len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) == STATE_OPEN {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }
}

use std::fs::File;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::compaction;
use crate::config::Config;
use crate::db::Shared;
use crate::error::{Error, Result};
use crate::index::IndexCommand;
use crate::record::Entry;
use crate::segment::{segment_file_name, Segment};

pub(crate) enum WriterCommand {
    Write {
        entry: Entry,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// The writer loop: the single task that owns the active file handle.
///
/// Appends are serialized by draining one channel, so no lock is held
/// across file IO. The index update for a record is queued before the
/// caller's reply is sent, which is what makes a Get issued after a
/// successful Put observe it.
pub(crate) struct Writer {
    shared: Arc<Shared>,
    config: Config,
    index_tx: mpsc::Sender<IndexCommand>,
    active: Arc<Segment>,
    file: File,
    // Bytes written to the active file. The writer is the sole appender
    // and every active file starts empty, so this equals the file size.
    size: u64,
}

impl Writer {
    pub(crate) fn new(
        shared: Arc<Shared>,
        config: Config,
        index_tx: mpsc::Sender<IndexCommand>,
        active: Arc<Segment>,
        file: File,
    ) -> Self {
        Self {
            shared,
            config,
            index_tx,
            active,
            file,
            size: 0,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<WriterCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                WriterCommand::Write { entry, reply } => {
                    let result = self.append(entry).await;
                    let _ = reply.send(result);
                }
                WriterCommand::Shutdown { reply } => {
                    let _ = reply.send(self.file.sync_all().map_err(Error::from));
                    break;
                }
            }
        }
        tracing::debug!("writer loop stopped");
    }

    async fn append(&mut self, entry: Entry) -> Result<()> {
        let len = entry.encoded_len();
        if self.size > 0 && self.size + len > self.config.max_segment_size {
            self.rotate()?;
        }

        self.file.write_all(&entry.encode())?;
        self.size += len;

        let update = IndexCommand::Update {
            segment: Arc::clone(&self.active),
            key: entry.key,
            len,
        };
        if self.index_tx.send(update).await.is_err() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Retires the active segment and allocates a fresh one. The new
    /// segment joins the shared list before any of its records can be
    /// written, and a merge of the older segments is kicked off once the
    /// list is long enough.
    fn rotate(&mut self) -> Result<()> {
        let id = self.shared.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = self.config.dir.join(segment_file_name(id));
        let (segment, file) = Segment::create(id, path)?;
        let segment = Arc::new(segment);

        let count = {
            let mut segments = self.shared.segments.write().unwrap();
            segments.push(Arc::clone(&segment));
            segments.len()
        };
        tracing::info!(segment_id = id, segment_count = count, "rotated active segment");

        self.active = segment;
        self.file = file;
        self.size = 0;

        if count >= self.config.min_compaction_segments {
            compaction::spawn(Arc::clone(&self.shared), self.config.clone());
        }
        Ok(())
    }
}

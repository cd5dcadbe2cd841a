use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::db::Shared;
use crate::segment::Segment;

/// Where a key's current record lives.
pub(crate) struct Location {
    pub(crate) segment: Arc<Segment>,
    pub(crate) offset: u64,
}

pub(crate) enum IndexCommand {
    /// A record of `len` bytes was appended to `segment` for `key`.
    Update {
        segment: Arc<Segment>,
        key: String,
        len: u64,
    },
    /// Find the newest segment containing `key`.
    Lookup {
        key: String,
        reply: oneshot::Sender<Option<Location>>,
    },
}

/// The index loop: the single task that mutates segment maps and owns the
/// running write offset.
///
/// Updates name their target segment explicitly, so an update queued just
/// before a rotation still lands in the segment its record was written to.
/// The offset restarts from zero the first time an update targets a new
/// segment; the writer sends updates in write order, so all updates for
/// one segment arrive before any update for its successor.
pub(crate) async fn run(shared: Arc<Shared>, mut commands: mpsc::Receiver<IndexCommand>) {
    let mut active_id: Option<u64> = None;
    let mut write_offset = 0u64;

    while let Some(command) = commands.recv().await {
        match command {
            IndexCommand::Update { segment, key, len } => {
                if active_id != Some(segment.id()) {
                    active_id = Some(segment.id());
                    write_offset = 0;
                }
                segment.insert(key, write_offset);
                write_offset += len;
            }
            IndexCommand::Lookup { key, reply } => {
                let _ = reply.send(lookup(&shared, &key));
            }
        }
    }
    tracing::debug!("index loop stopped");
}

// Newest-first scan over the current segment list snapshot.
fn lookup(shared: &Shared, key: &str) -> Option<Location> {
    let segments = shared.segments.read().unwrap();
    segments.iter().rev().find_map(|segment| {
        segment.offset_of(key).map(|offset| Location {
            segment: Arc::clone(segment),
            offset,
        })
    })
}

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::observability::{JOURNAL_FLUSH_BATCH_SIZE, JOURNAL_FLUSH_DURATION_SECONDS};
use crate::scheduler::{AssignmentSink, Scheduler};

const RECORD_OVERHEAD: u64 = 8;
const CHANNEL_CAPACITY: usize = 4096;
const MAX_BATCH: usize = 512;

/// Write one `[len][bincode][crc32]` record. Returns the bytes written.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "journal record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(payload.len() as u64 + RECORD_OVERHEAD)
}

/// Read records until EOF or the first damaged one.
/// Returns the events and the byte length of the intact prefix.
fn read_records(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        if !read_full(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if !read_full(&mut reader, &mut payload)? {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if !read_full(&mut reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
        intact += len as u64 + RECORD_OVERHEAD;
    }

    Ok((events, intact))
}

/// `false` on a short read at end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Append-only assignment journal.
///
/// Each record is `[u32 len][bincode Event][u32 crc32]`, little endian. A torn
/// or corrupt tail ends replay; [`Wal::recover`] cuts it off so later appends
/// are not hidden behind it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful sync.
    committed_len: u64,
    pending_len: u64,
    pending_records: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            committed_len,
            pending_len: 0,
            pending_records: 0,
            appends_since_compact: 0,
        })
    }

    /// Replay, drop any damaged tail, and open for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, intact) = read_records(path)?;
        let wal = Self::open(path)?;
        if wal.committed_len > intact {
            tracing::warn!(
                path = %path.display(),
                discarded = wal.committed_len - intact,
                "journal tail damaged, truncating"
            );
            wal.writer.get_ref().set_len(intact)?;
            wal.writer.get_ref().sync_all()?;
            return Ok((Self::open(path)?, events));
        }
        Ok((wal, events))
    }

    /// All intact events on disk, oldest first.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_records(path).map(|(events, _)| events)
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one record. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.pending_len += encode_record(&mut self.writer, event)?;
        self.pending_records += 1;
        Ok(())
    }

    /// Flush buffered records and fsync.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_len;
        self.appends_since_compact += self.pending_records;
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    /// Throw away everything since the last successful sync, in memory and on disk.
    pub fn discard_uncommitted(&mut self) -> io::Result<()> {
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(open_append(&self.path)?));
        // into_parts drops the buffer without writing it out
        drop(stale.into_parts());
        self.writer.get_ref().set_len(self.committed_len)?;
        self.writer.get_ref().sync_all()?;
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    /// Replace the file with `events`: temp file, fsync, rename, reopen.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        let mut len = 0u64;
        for event in events {
            len += encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp_path, &self.path)?;
        self.writer = BufWriter::new(open_append(&self.path)?);
        self.committed_len = len;
        self.pending_len = 0;
        self.pending_records = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Records synced since open or the last compaction.
    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.committed_len
    }

    pub fn is_empty(&self) -> bool {
        self.committed_len == 0
    }
}

// ── Group-commit writer ──────────────────────────────────────────

enum JournalCommand {
    Append {
        event: Event,
        reply: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        reply: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        reply: oneshot::Sender<u64>,
    },
}

/// Handle to the background task that owns the [`Wal`].
///
/// Appends queue up while a sync is in progress and go to disk together on the
/// next one, so concurrent writers share one fsync.
#[derive(Clone)]
pub struct WalJournal {
    tx: mpsc::Sender<JournalCommand>,
}

impl WalJournal {
    /// Spawn the writer task. Needs a running tokio runtime.
    pub fn start(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    pub async fn append(&self, event: &Event) -> io::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(JournalCommand::Append {
            event: event.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(JournalCommand::Compact { events, reply }).await?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn appends_since_compact(&self) -> io::Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(JournalCommand::AppendsSinceCompact { reply }).await?;
        rx.await.map_err(|_| writer_gone())
    }

    /// Rewrite the journal from the scheduler's live state. Mutations wait
    /// until the new file is in place. Returns the number of records written.
    pub async fn compact_from(&self, scheduler: &Scheduler) -> io::Result<usize> {
        let _pause = scheduler.pause_mutations().await;
        let events = scheduler.snapshot_events().await;
        let count = events.len();
        self.compact(events).await?;
        Ok(count)
    }

    async fn send(&self, cmd: JournalCommand) -> io::Result<()> {
        self.tx.send(cmd).await.map_err(|_| writer_gone())
    }
}

#[async_trait]
impl AssignmentSink for WalJournal {
    async fn persist(&self, event: &Event) -> io::Result<()> {
        self.append(event).await
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "journal writer stopped")
}

async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<JournalCommand>) {
    let mut deferred: Option<JournalCommand> = None;
    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            JournalCommand::Append { event, reply } => {
                let mut batch = vec![(event, reply)];
                while batch.len() < MAX_BATCH {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, reply }) => batch.push((event, reply)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, batch);
            }
            JournalCommand::Compact { events, reply } => {
                let result = wal.compact(&events);
                match &result {
                    Ok(()) => tracing::info!(records = events.len(), "journal compacted"),
                    Err(e) => tracing::error!("journal compaction failed: {e}"),
                }
                let _ = reply.send(result);
            }
            JournalCommand::AppendsSinceCompact { reply } => {
                let _ = reply.send(wal.appends_since_compact());
            }
        }
    }
    tracing::debug!("journal writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        tracing::error!(batch = batch.len(), "journal sync failed: {e}");
        if let Err(cleanup) = wal.discard_uncommitted() {
            tracing::error!("journal cleanup after failed sync: {cleanup}");
            result = Err(cleanup);
        }
    }
    metrics::histogram!(JOURNAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, reply) in batch {
        let outcome = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = reply.send(outcome);
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Anything longer is a corrupt length prefix, not a record.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Encode one record as `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read `buf.len()` bytes, or report a clean/torn end of file as `None`.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Append-only log of [`Event`] records.
///
/// A crash can leave a torn final record; replay stops at the first record
/// whose length, checksum or payload does not check out and keeps everything
/// before it.
///
/// Appends are staged in memory and reach the file only in `flush_sync`.
/// A batch that fails is dropped with `discard_pending`, which also cuts the
/// file back to its last durable length.
pub struct Wal {
    file: File,
    path: PathBuf,
    pending: Vec<u8>,
    pending_appends: u64,
    durable_len: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_appends: 0,
            durable_len,
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one record. Production goes through the group-commit
    /// writer instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage one record; nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.pending, event)?;
        self.pending_appends += 1;
        Ok(())
    }

    /// Write and fsync every staged record. On error the staged records are
    /// kept; the caller decides whether to retry or `discard_pending`.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.write_all(&self.pending)?;
        self.file.sync_all()?;
        self.durable_len += self.pending.len() as u64;
        self.appends_since_compact += self.pending_appends;
        self.pending.clear();
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop staged records and truncate anything a failed flush left past
    /// the last durable record, so replay never sees half a batch.
    pub fn discard_pending(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.pending_appends = 0;
        self.file.set_len(self.durable_len)?;
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as exactly `events`: write a temp file, fsync it,
    /// rename it over the live log and reopen for appends.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_record(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.file = file;
        self.pending.clear();
        self.pending_appends = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// All intact records in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match next_record(&mut reader)? {
                Record::Event(event) => events.push(event),
                Record::End => break,
                Record::Corrupt(why) => {
                    tracing::warn!(
                        "WAL {}: {why} after {} events, ignoring the rest",
                        path.display(),
                        events.len()
                    );
                    break;
                }
            }
        }
        Ok(events)
    }
}

enum Record {
    Event(Event),
    End,
    Corrupt(String),
}

fn next_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut header = [0u8; 4];
    if read_or_eof(reader, &mut header)?.is_none() {
        return Ok(Record::End);
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Record::Corrupt(format!("implausible record length {len}")));
    }

    let mut payload = vec![0u8; len];
    let mut trailer = [0u8; 4];
    if read_or_eof(reader, &mut payload)?.is_none() || read_or_eof(reader, &mut trailer)?.is_none() {
        return Ok(Record::Corrupt("torn record".into()));
    }
    if u32::from_le_bytes(trailer) != crc32fast::hash(&payload) {
        return Ok(Record::Corrupt("checksum mismatch".into()));
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Record::Event(event),
        Err(e) => Record::Corrupt(format!("undecodable record ({e})")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use rust_decimal_macros::dec;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn window_created() -> Event {
        Event::WindowCreated {
            window: AvailabilityWindow {
                id: Ulid::new(),
                expert_id: Ulid::new(),
                span: Span::new(10 * HOUR, 11 * HOUR),
                price: dec!(75.50),
                requires_approval: true,
                status: WindowStatus::Active,
                origin: None,
                created_at: 1,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let first = window_created();
        let second = Event::WindowStatusChanged {
            id: Ulid::new(),
            status: WindowStatus::Disabled,
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = window_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = window_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&window_created()).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let kept = window_created();
        let after = window_created();

        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&window_created()).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&kept)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&after).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| window_created()).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 0);
            assert_eq!(fs::metadata(&path).unwrap().len(), 0);
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn discarded_batch_never_replays() {
        let path = tmp_path("discarded_batch.wal");
        let first = window_created();
        let third = window_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            let durable = fs::metadata(&path).unwrap().len();

            wal.append_buffered(&window_created()).unwrap();
            wal.append_buffered(&window_created()).unwrap();
            // Bytes a failed flush might have left behind.
            OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap()
                .write_all(&[7u8; 32])
                .unwrap();
            wal.discard_pending().unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), durable);
            assert_eq!(wal.appends_since_compact(), 1);

            wal.append(&third).unwrap();
            assert_eq!(wal.appends_since_compact(), 2);
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, third]);
    }

    #[test]
    fn reopened_log_truncates_to_its_own_tail() {
        let path = tmp_path("reopen_discard.wal");
        let first = window_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&window_created()).unwrap();
            wal.discard_pending().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }
}

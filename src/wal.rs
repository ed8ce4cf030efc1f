use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest record replay will try to read; anything bigger is treated as a torn length prefix.
const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

/// Encode one unit of work to [len][bincode][crc32] format, returning the
/// number of bytes written.
fn encode_commit(writer: &mut impl Write, events: &[Event]) -> io::Result<u64> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(payload.len() as u64 + 8)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Append-only Write-Ahead Log of committed units of work.
///
/// Format per record: `[u32: len][bincode: Vec<Event>][u32: crc32]`.
/// A record is the whole unit of work, so a torn write drops the entire unit
/// on replay and never leaves half a reservation behind.
///
/// Bytes past `durable_len` belong to units nobody has been told about yet.
/// A failed batch is cut back to `durable_len`, so a caller that saw an error
/// never finds its unit replayed later.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful fsync.
    durable_len: u64,
    pending_bytes: u64,
    pending_units: u64,
    /// Set when a rollback itself failed; the tail can no longer be trusted.
    poisoned: bool,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            pending_bytes: 0,
            pending_units: 0,
            poisoned: false,
            #[cfg(test)]
            fail_after: None,
        })
    }

    /// Make appends fail once `after` more units have been buffered; `None`
    /// heals the log again. A failing append leaves half a record on disk.
    #[cfg(test)]
    pub fn fail_appends_after(&mut self, after: Option<usize>) {
        self.fail_after = after;
    }

    #[cfg(test)]
    fn injected_fault(&mut self, events: &[Event]) -> io::Result<()> {
        match self.fail_after {
            Some(0) => {
                let mut record = Vec::new();
                encode_commit(&mut record, events)?;
                self.writer.write_all(&record[..record.len() / 2])?;
                self.pending_bytes += (record.len() / 2) as u64;
                // Push earlier buffered units and the torn half onto disk.
                self.writer.flush()?;
                Err(io::Error::other("injected write failure"))
            }
            Some(n) => {
                self.fail_after = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Append one unit of work and fsync. The writer task batches with
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Buffer one unit of work without flushing or syncing.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL tail could not be rolled back, refusing appends"));
        }
        #[cfg(test)]
        self.injected_fault(events)?;
        self.pending_bytes += encode_commit(&mut self.writer, events)?;
        self.pending_units += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file. Everything buffered
    /// so far becomes durable.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.pending_bytes;
        self.appends_since_compact += self.pending_units;
        self.pending_bytes = 0;
        self.pending_units = 0;
        Ok(())
    }

    /// Drop every unit buffered since the last successful `flush_sync`,
    /// including bytes that already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.pending_bytes = 0;
        self.pending_units = 0;
        let result = open_append(&self.path).and_then(|file| {
            // into_parts hands back the buffer instead of flushing it on drop.
            let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
            let _ = stale.into_parts();
            let file = self.writer.get_ref();
            file.set_len(self.durable_len)?;
            file.sync_all()
        });
        if let Err(e) = &result {
            tracing::error!(error = %e, "WAL rollback failed, further appends refused");
            self.poisoned = true;
        }
        result
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a temp file next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, commits: &[Vec<Event>]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for events in commits {
            encode_commit(&mut writer, events)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = open_append(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending_bytes = 0;
        self.pending_units = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, commits: &[Vec<Event>]) -> io::Result<()> {
        Self::write_compact_file(&self.path, commits)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning every intact unit of work in order.
    /// Truncated/corrupt trailing records are discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Vec<Event>>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut commits = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_BYTES {
                tracing::warn!("WAL record length {len} exceeds limit, stopping replay");
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!("WAL checksum mismatch after {} records, stopping replay", commits.len());
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(events) => commits.push(events),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Customer, Room};

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn room_saved(number: &str) -> Event {
        Event::RoomSaved {
            room: Room::new(number, 2),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let commits = vec![
            vec![room_saved("101"), room_saved("102")],
            vec![Event::CustomerSaved {
                customer: Customer::new("Ana Ruiz"),
            }],
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append(c).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, commits);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_torn_unit_of_work() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let first = vec![room_saved("101")];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }

        // Simulate a crash halfway through writing a second multi-event record
        {
            let payload = bincode::serialize(&vec![room_saved("102"), room_saved("103")]).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload[..payload.len() / 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![first]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_units_of_a_failed_batch() {
        let path = tmp_path("rollback_batch.wal");
        let _ = fs::remove_file(&path);

        let kept = vec![room_saved("101")];
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let durable = fs::metadata(&path).unwrap().len();

        wal.fail_appends_after(Some(1));
        wal.append_buffered(&[room_saved("102")]).unwrap();
        assert!(wal.append_buffered(&[room_saved("103")]).is_err());
        assert!(fs::metadata(&path).unwrap().len() > durable);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), durable);
        assert_eq!(wal.appends_since_compact(), 1);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept.clone()]);

        // The log stays usable once the fault clears.
        wal.fail_appends_after(None);
        let next = vec![room_saved("104")];
        wal.append(&next).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, next]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        {
            let payload = bincode::serialize(&vec![room_saved("101")]).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let snapshot = vec![vec![room_saved("101")]];
        let next = vec![room_saved("102")];

        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&[room_saved("tmp")]).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 10);
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&next).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], snapshot[0]);
        assert_eq!(replayed[1], next);

        let _ = fs::remove_file(&path);
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Commit;

/// Length prefix plus CRC trailer around each payload.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single commit as `[len][bincode][crc32]`.
fn encode_commit(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next frame and its size on disk. `None` on clean EOF, a torn
/// tail, or a bad checksum.
fn decode_commit(reader: &mut impl Read) -> io::Result<Option<(Commit, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }

    Ok(bincode::deserialize::<Commit>(&payload)
        .ok()
        .map(|commit| (commit, len as u64 + FRAME_OVERHEAD)))
}

/// Intact commits recovered from a log, and where the last one ends.
#[derive(Debug, Default)]
pub struct Replay {
    pub commits: Vec<Commit>,
    pub valid_len: u64,
}

/// Append-only write-ahead log of committed transactions.
///
/// Each frame holds one [`Commit`], so a transaction's events are replayed
/// together or, if the frame was torn by a crash, not at all. Appends are
/// staged in memory and reach the file only in `flush_sync`; a failed flush
/// cuts the file back to the last synced frame.
pub struct Wal {
    file: File,
    pending: Vec<u8>,
    pending_commits: u64,
    synced_len: u64,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open for appends after `valid_len`, the end of the last intact frame
    /// found by [`Wal::replay`]. Anything past it is a torn tail and is cut.
    pub fn open(path: &Path, valid_len: u64) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                "discarding {} damaged bytes at the end of {}",
                on_disk - valid_len,
                path.display()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let synced_len = on_disk.min(valid_len);
        file.seek(SeekFrom::Start(synced_len))?;
        Ok(Self {
            file,
            pending: Vec::new(),
            pending_commits: 0,
            synced_len,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Stage one commit. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        let mut frame = Vec::new();
        encode_commit(&mut frame, commit)?;
        self.pending.extend_from_slice(&frame);
        self.pending_commits += 1;
        Ok(())
    }

    /// Write and fsync everything staged. On failure the file is cut back to
    /// its last synced length and the staged frames are dropped.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let written = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.sync_all());
        match written {
            Ok(()) => {
                self.synced_len += self.pending.len() as u64;
                self.appends_since_compact += self.pending_commits;
                self.pending.clear();
                self.pending_commits = 0;
                Ok(())
            }
            Err(e) => {
                if let Err(cut) = self.rollback() {
                    warn!("could not cut {} back after a failed flush: {cut}", self.path.display());
                }
                Err(e)
            }
        }
    }

    /// Drop staged frames and truncate to the last synced frame.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.pending_commits = 0;
        self.file.set_len(self.synced_len)?;
        self.file.seek(SeekFrom::Start(self.synced_len))?;
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to `<wal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, snapshot: &Commit) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        encode_commit(&mut writer, snapshot)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let len = file.seek(SeekFrom::End(0))?;
        self.file = file;
        self.synced_len = len;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &Commit) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact commit. Replay stops at the first damaged frame and
    /// reports where the intact prefix ends.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        while let Some((commit, frame_len)) = decode_commit(&mut reader)? {
            replay.commits.push(commit);
            replay.valid_len += frame_len;
        }
        Ok(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn at(h: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 9).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn credit(user: &str, amount: Credits) -> Event {
        Event::CreditAppended {
            transaction: CreditTransaction {
                id: Ulid::new(),
                user_id: user.into(),
                amount,
                kind: TransactionType::Purchase,
                reference_id: Some("pay_1".into()),
                note: None,
                created_at: at(8),
            },
        }
    }

    fn booking_commit(user: &str) -> Commit {
        let reservation = Reservation {
            id: Ulid::new(),
            user_id: user.into(),
            source: SlotRef::Block(Ulid::new()),
            date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            span: Span::hm((9, 0), (10, 0)),
            status: ReservationStatus::Confirmed,
            credits_used: 1,
            created_at: at(8),
            cancelled_at: None,
            note: None,
        };
        Commit {
            events: vec![
                Event::ReservationCreated { reservation },
                credit(user, -1),
            ],
        }
    }

    #[test]
    fn append_and_replay_preserves_commit_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenant.wal");

        let commits = vec![Commit { events: vec![credit("ana", 5)] }, booking_commit("ana")];
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for c in &commits {
                wal.append(c).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap().commits;
        assert_eq!(replayed, commits);
        assert_eq!(replayed[1].events.len(), 2);
    }

    #[test]
    fn torn_commit_is_dropped_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.wal");

        let first = Commit { events: vec![credit("ana", 5)] };
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&first).unwrap();
        }

        // Half of a booking frame: reservation bytes without the ledger debit or CRC.
        {
            let payload = bincode::serialize(&booking_commit("ana")).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload[..payload.len() / 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap().commits;
        assert_eq!(replayed, vec![first]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let replayed = Wal::replay(&dir.path().join("absent.wal")).unwrap();
        assert!(replayed.commits.is_empty());
        assert_eq!(replayed.valid_len, 0);
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad_crc.wal");

        {
            let payload = bincode::serialize(&booking_commit("bo")).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.commits.is_empty());
        assert_eq!(replayed.valid_len, 0);
    }

    #[test]
    fn compact_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compact.wal");

        let snapshot = Commit { events: vec![credit("ana", 4)] };
        let later = booking_commit("ana");
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for _ in 0..10 {
                wal.append(&Commit { events: vec![credit("ana", 1), credit("ana", -1)] })
                    .unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 10);
            let before = fs::metadata(&path).unwrap().len();

            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);

            wal.append_buffered(&later).unwrap();
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap().commits;
        assert_eq!(replayed, vec![snapshot, later]);
    }

    #[test]
    fn reopen_cuts_torn_tail_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.wal");

        let first = Commit { events: vec![credit("ana", 5)] };
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&first).unwrap();
        }
        let clean_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xAB; 7]).unwrap();
        }

        let recovered = Wal::replay(&path).unwrap();
        assert_eq!(recovered.commits, vec![first.clone()]);
        assert_eq!(recovered.valid_len, clean_len);

        let later = booking_commit("ana");
        {
            let mut wal = Wal::open(&path, recovered.valid_len).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
            wal.append(&later).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.commits, vec![first, later]);
        assert_eq!(replayed.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn rollback_drops_staged_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollback.wal");

        let kept = Commit { events: vec![credit("ana", 5)] };
        let mut wal = Wal::open(&path, 0).unwrap();
        wal.append(&kept).unwrap();
        let synced = fs::metadata(&path).unwrap().len();

        wal.append_buffered(&booking_commit("ana")).unwrap();
        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);
        assert_eq!(wal.appends_since_compact(), 1);

        let after = booking_commit("bo");
        wal.append(&after).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap().commits, vec![kept, after]);
    }
}

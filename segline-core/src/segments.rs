//! Segment table: the persisted completion state of a resumable download.
//!
//! A `<destination>.sgt` file sits next to the partially written destination and
//! is exclusively locked for as long as a download runs, so at most one writer
//! touches a destination at a time. All integers are little-endian.
//!
//! ```text
//! 8 bytes   magic "EosSgtV1"
//! 1 byte    mode
//! 7 bytes   reserved flags
//!
//! mode 0 (basic):
//!   u64     num_segments
//!   bitmap  ceil(num_segments / 8) bytes, MSB of the first byte is segment 0;
//!           a set bit means the segment is complete
//!
//! mode 1 (hole-compressed):
//!   u64     num_segments
//!   u64     num_complete_segments   every segment below this index is complete...
//!   u64     num_holes
//!   u64     hole_index * num_holes  ...except these
//! ```
//!
//! Only mode 1 is written. Only `Complete` survives a write: a segment that was
//! in flight is persisted as not complete and fetched again after a restart.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

pub const SEGMENT_TABLE_MAGIC: &[u8; 8] = b"EosSgtV1";

/// Extension appended to the destination path to name its table.
pub const SEGMENT_TABLE_EXTENSION: &str = "sgt";

/// Largest segment count accepted from disk.
pub const MAX_SEGMENTS: u64 = 1 << 28;

const MODE_BASIC: u8 = 0;
const MODE_HOLES: u8 = 1;
const FLAGS_LEN: usize = 7;

/// Per-segment transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentState {
    Unsent,
    Outgoing,
    Complete,
}

#[derive(Debug, thiserror::Error)]
pub enum SegmentTableError {
    #[error("segment table {} is locked by another download", .0.display())]
    ConcurrentDownload(PathBuf),
    #[error("corrupt segment table: {0}")]
    Corrupt(&'static str),
    #[error("segment table I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize a segment table in hole-compressed form.
///
/// The complete prefix ends after the last complete segment; every segment below
/// it that is not complete is listed as a hole. This encodes any completion set,
/// including tables resumed from basic-mode bitmaps with scattered gaps.
pub fn encode(segments: &[SegmentState]) -> Vec<u8> {
    let num_complete = segments
        .iter()
        .rposition(|s| *s == SegmentState::Complete)
        .map_or(0, |i| i + 1);
    let holes: Vec<u64> = segments[..num_complete]
        .iter()
        .enumerate()
        .filter(|(_, s)| **s != SegmentState::Complete)
        .map(|(i, _)| i as u64)
        .collect();

    let mut out = header(MODE_HOLES, 24 + holes.len() * 8);
    out.extend_from_slice(&(segments.len() as u64).to_le_bytes());
    out.extend_from_slice(&(num_complete as u64).to_le_bytes());
    out.extend_from_slice(&(holes.len() as u64).to_le_bytes());
    for hole in holes {
        out.extend_from_slice(&hole.to_le_bytes());
    }
    out
}

fn header(mode: u8, body_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEGMENT_TABLE_MAGIC.len() + 1 + FLAGS_LEN + body_len);
    out.extend_from_slice(SEGMENT_TABLE_MAGIC);
    out.push(mode);
    out.extend_from_slice(&[0u8; FLAGS_LEN]);
    out
}

/// Parse a segment table written in either mode. Every segment comes back as
/// `Complete` or `Unsent`.
pub fn decode(bytes: &[u8]) -> Result<Vec<SegmentState>, SegmentTableError> {
    let mut r = Reader { bytes, pos: 0 };
    if r.take(SEGMENT_TABLE_MAGIC.len())? != SEGMENT_TABLE_MAGIC {
        return Err(SegmentTableError::Corrupt("bad magic"));
    }
    let mode = r.take(1)?[0];
    r.take(FLAGS_LEN)?;

    let num_segments = r.read_u64()?;
    if num_segments > MAX_SEGMENTS {
        return Err(SegmentTableError::Corrupt("segment count out of range"));
    }
    let num_segments = num_segments as usize;

    match mode {
        MODE_BASIC => {
            let bitmap = r.take(num_segments.div_ceil(8))?;
            Ok((0..num_segments)
                .map(|i| {
                    if bitmap[i / 8] & (0x80 >> (i % 8)) != 0 {
                        SegmentState::Complete
                    } else {
                        SegmentState::Unsent
                    }
                })
                .collect())
        }
        MODE_HOLES => {
            let num_complete = r.read_u64()?;
            if num_complete > num_segments as u64 {
                return Err(SegmentTableError::Corrupt("complete prefix past end of table"));
            }
            let num_complete = num_complete as usize;
            let mut segments = vec![SegmentState::Complete; num_complete];
            segments.resize(num_segments, SegmentState::Unsent);

            let num_holes = r.read_u64()?;
            for _ in 0..num_holes {
                let hole = r.read_u64()?;
                if hole >= num_complete as u64 {
                    return Err(SegmentTableError::Corrupt("hole outside complete prefix"));
                }
                segments[hole as usize] = SegmentState::Unsent;
            }
            Ok(segments)
        }
        _ => Err(SegmentTableError::Corrupt("unknown mode")),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SegmentTableError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(SegmentTableError::Corrupt("truncated"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u64(&mut self) -> Result<u64, SegmentTableError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }
}

/// One-line picture of a table for log output: `_` unsent, `o` in flight, `#` complete.
/// Each character averages a run of segments so the line is at most `width` long.
pub fn render(segments: &[SegmentState], width: usize) -> String {
    if segments.is_empty() || width == 0 {
        return String::new();
    }
    let step = segments.len().div_ceil(width);
    segments
        .chunks(step)
        .map(|run| {
            let weight: usize = run
                .iter()
                .map(|s| match s {
                    SegmentState::Unsent => 0,
                    SegmentState::Outgoing => 1,
                    SegmentState::Complete => 2,
                })
                .sum();
            ['_', 'o', '#'][weight / run.len()]
        })
        .collect()
}

/// File-backed segment table holding an exclusive advisory lock.
///
/// Dropping the table releases the lock and leaves the file for a later resume.
pub struct SegmentTable {
    file: File,
    path: PathBuf,
}

impl SegmentTable {
    /// Table path for a destination: `<destination>.sgt`.
    pub fn path_for(destination: &Path) -> PathBuf {
        let mut os = destination.as_os_str().to_owned();
        os.push(".");
        os.push(SEGMENT_TABLE_EXTENSION);
        PathBuf::from(os)
    }

    /// Open (creating if absent) and lock the table at `path`.
    ///
    /// A lock held elsewhere is reported as [`SegmentTableError::ConcurrentDownload`]
    /// straight away; the caller decides whether to wait on the other writer.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SegmentTableError> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(SegmentTableError::ConcurrentDownload(path));
            }
            return Err(SegmentTableError::Io(e));
        }
        debug!(path = %path.display(), "segment table locked");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted table. A fresh (empty) file reads as corrupt: there is
    /// nothing to resume from.
    pub fn read(&mut self) -> Result<Vec<SegmentState>, SegmentTableError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        decode(&buf)
    }

    /// Replace the file content with `segments`.
    pub fn write(&mut self, segments: &[SegmentState]) -> Result<(), SegmentTableError> {
        let bytes = encode(segments);
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    /// Release the lock, deleting the file first when `unlink` is set.
    pub fn close(self, unlink: bool) -> Result<(), SegmentTableError> {
        if unlink {
            std::fs::remove_file(&self.path)?;
            debug!(path = %self.path.display(), "segment table removed");
        }
        Ok(())
    }
}

impl Drop for SegmentTable {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
fn encode_basic(segments: &[SegmentState]) -> Vec<u8> {
    let mut out = header(MODE_BASIC, 8 + segments.len().div_ceil(8));
    out.extend_from_slice(&(segments.len() as u64).to_le_bytes());
    for run in segments.chunks(8) {
        let byte = run.iter().enumerate().fold(0u8, |acc, (i, s)| {
            if *s == SegmentState::Complete {
                acc | (0x80 >> i)
            } else {
                acc
            }
        });
        out.push(byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    use SegmentState::{Complete as C, Outgoing as O, Unsent as U};

    fn completion(segments: &[SegmentState]) -> Vec<bool> {
        segments.iter().map(|s| *s == C).collect()
    }

    #[test]
    fn hole_compressed_layout() {
        let bytes = encode(&[C, C, O, C, U, U]);
        assert_eq!(&bytes[..8], b"EosSgtV1");
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[9..16], &[0u8; 7]);
        let field = |i: usize| u64::from_le_bytes(bytes[16 + i * 8..24 + i * 8].try_into().unwrap());
        assert_eq!(field(0), 6); // num_segments
        assert_eq!(field(1), 4); // num_complete_segments
        assert_eq!(field(2), 1); // num_holes
        assert_eq!(field(3), 2); // the in-flight segment
        assert_eq!(bytes.len(), 16 + 32);
    }

    #[test]
    fn outgoing_reads_back_unsent() {
        let decoded = decode(&encode(&[C, O, O, U])).unwrap();
        assert_eq!(decoded, vec![C, U, U, U]);
    }

    #[test]
    fn scattered_gaps_survive_write() {
        let table = [C, U, C, U, C, U, U];
        let decoded = decode(&encode(&table)).unwrap();
        assert_eq!(decoded, vec![C, U, C, U, C, U, U]);
    }

    #[test]
    fn basic_mode_bitmap_is_msb_first() {
        let table = [C, U, U, U, U, U, U, C, C];
        let bytes = encode_basic(&table);
        assert_eq!(bytes[8], 0);
        assert_eq!(&bytes[24..], &[0b1000_0001, 0b1000_0000]);
        assert_eq!(decode(&bytes).unwrap(), table.to_vec());
    }

    #[test]
    fn basic_mode_ignores_trailing_bits() {
        let mut bytes = encode_basic(&[C, U, C]);
        let last = bytes.len() - 1;
        bytes[last] |= 0b0001_1111;
        assert_eq!(decode(&bytes).unwrap(), vec![C, U, C]);
    }

    #[test]
    fn empty_table() {
        assert_eq!(decode(&encode(&[])).unwrap(), Vec::<SegmentState>::new());
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut bytes = encode(&[C]);
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(SegmentTableError::Corrupt(_))));
        assert!(matches!(decode(b""), Err(SegmentTableError::Corrupt(_))));
    }

    #[test]
    fn unknown_mode_is_corrupt() {
        let mut bytes = encode(&[C]);
        bytes[8] = 2;
        assert!(matches!(decode(&bytes), Err(SegmentTableError::Corrupt(_))));
    }

    #[test]
    fn truncation_is_corrupt_at_every_length() {
        let bytes = encode(&[C, U, C, C, U]);
        for len in 0..bytes.len() {
            assert!(
                matches!(decode(&bytes[..len]), Err(SegmentTableError::Corrupt(_))),
                "prefix of {} bytes decoded",
                len
            );
        }
        let basic = encode_basic(&[C; 12]);
        assert!(decode(&basic[..basic.len() - 1]).is_err());
    }

    #[test]
    fn impossible_counts_are_corrupt() {
        let mut bytes = header(MODE_HOLES, 24);
        bytes.extend_from_slice(&3u64.to_le_bytes());
        bytes.extend_from_slice(&5u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(SegmentTableError::Corrupt(_))));

        let mut bytes = header(MODE_HOLES, 32);
        bytes.extend_from_slice(&3u64.to_le_bytes());
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&2u64.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(SegmentTableError::Corrupt(_))));

        let mut bytes = header(MODE_BASIC, 8);
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(SegmentTableError::Corrupt(_))));
    }

    #[test]
    fn render_averages_runs() {
        assert_eq!(render(&[C, C, O, O, U, U], 3), "#o_");
        assert_eq!(render(&[C, U], 10), "#_");
        assert_eq!(render(&[C, U, U, U], 2), "o_");
        assert_eq!(render(&[], 8), "");
    }

    #[test]
    fn path_for_appends_extension() {
        assert_eq!(
            SegmentTable::path_for(Path::new("/tmp/shard.bin")),
            PathBuf::from("/tmp/shard.bin.sgt")
        );
    }

    #[test]
    fn file_write_read_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.sgt");
        let mut table = SegmentTable::open(&path).unwrap();
        assert!(matches!(table.read(), Err(SegmentTableError::Corrupt(_))));

        table.write(&[C, C, C, U, U]).unwrap();
        // A shorter rewrite must not leave stale bytes behind.
        table.write(&[C, U]).unwrap();
        assert_eq!(table.read().unwrap(), vec![C, U]);
        table.close(false).unwrap();

        let mut reopened = SegmentTable::open(&path).unwrap();
        assert_eq!(reopened.read().unwrap(), vec![C, U]);
        reopened.close(true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn second_open_reports_concurrent_download() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("busy.sgt");
        let mut first = SegmentTable::open(&path).unwrap();
        first.write(&[C, C, U]).unwrap();

        match SegmentTable::open(&path) {
            Err(SegmentTableError::ConcurrentDownload(p)) => assert_eq!(p, path),
            other => panic!("expected ConcurrentDownload, got {:?}", other.map(|_| ())),
        }
        assert_eq!(first.read().unwrap(), vec![C, C, U]);

        drop(first);
        let mut second = SegmentTable::open(&path).unwrap();
        assert_eq!(second.read().unwrap(), vec![C, C, U]);
    }

    fn arb_table() -> impl Strategy<Value = Vec<SegmentState>> {
        proptest::collection::vec(prop_oneof![Just(U), Just(O), Just(C)], 0..300)
    }

    proptest! {
        #[test]
        fn write_then_read_preserves_completion(table in arb_table()) {
            let decoded = decode(&encode(&table)).unwrap();
            prop_assert_eq!(completion(&decoded), completion(&table));
            prop_assert!(decoded.iter().all(|s| *s != O));
        }

        #[test]
        fn basic_mode_preserves_completion(table in arb_table()) {
            let decoded = decode(&encode_basic(&table)).unwrap();
            prop_assert_eq!(completion(&decoded), completion(&table));
        }
    }
}

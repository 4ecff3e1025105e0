//! Destinations a consumer writes segments into.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Random-access sink for one resource.
pub trait Destination {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()>;

    /// Reserve room for `size` bytes once the total is known.
    fn preallocate(&mut self, _size: u64) -> io::Result<()> {
        Ok(())
    }

    /// Cut or extend the content to exactly `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Make the written content visible under its final name.
    fn finalize(&mut self) -> io::Result<()>;
}

impl<T: Destination + ?Sized> Destination for Box<T> {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, bytes)
    }

    fn preallocate(&mut self, size: u64) -> io::Result<()> {
        (**self).preallocate(size)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        (**self).truncate(len)
    }

    fn finalize(&mut self) -> io::Result<()> {
        (**self).finalize()
    }
}

/// Writes to `<path>.part` and renames to `path` on finalize.
pub struct PartFile {
    file: File,
    part_path: PathBuf,
    final_path: PathBuf,
    existed: bool,
}

impl PartFile {
    /// Open the partial file for `path`, creating it and its parent directories if needed.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let final_path = path.as_ref().to_path_buf();
        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let part_path = Self::part_path_for(&final_path);
        let existed = part_path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&part_path)?;
        Ok(Self {
            file,
            part_path,
            final_path,
            existed,
        })
    }

    pub fn part_path_for(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(".part");
        PathBuf::from(os)
    }

    /// Whether a partial file from an earlier run was found, i.e. whether
    /// persisted segment state still has data behind it.
    pub fn resumable(&self) -> bool {
        self.existed
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }
}

impl Destination for PartFile {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)
    }

    /// Sets the exact length, dropping anything a previous run left past `size`.
    fn preallocate(&mut self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn finalize(&mut self) -> io::Result<()> {
        self.file.sync_all()?;
        std::fs::rename(&self.part_path, &self.final_path)?;
        debug!(path = %self.final_path.display(), "destination finalized");
        Ok(())
    }
}

/// In-memory destination; finalize only flips a flag.
#[derive(Debug, Default, Clone)]
pub struct MemoryDestination {
    pub bytes: Vec<u8>,
    pub finalized: bool,
}

impl Destination for MemoryDestination {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start + bytes.len();
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length too large"))?;
        self.bytes.resize(len, 0);
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        self.finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn part_file_writes_out_of_order_and_renames() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/out.bin");
        let mut dest = PartFile::create(&path).unwrap();
        assert!(!dest.resumable());
        dest.preallocate(8).unwrap();
        dest.write_at(4, b"5678").unwrap();
        dest.write_at(0, b"1234").unwrap();
        assert!(PartFile::part_path_for(&path).exists());
        dest.finalize().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"12345678");
        assert!(!PartFile::part_path_for(&path).exists());
    }

    #[test]
    fn reopening_keeps_partial_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        {
            let mut dest = PartFile::create(&path).unwrap();
            dest.write_at(0, b"abcd").unwrap();
        }
        let mut dest = PartFile::create(&path).unwrap();
        assert!(dest.resumable());
        dest.write_at(4, b"ef").unwrap();
        dest.finalize().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn preallocate_and_truncate_set_exact_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("long.bin");
        std::fs::write(PartFile::part_path_for(&path), vec![0xAA; 100]).unwrap();

        let mut dest = PartFile::create(&path).unwrap();
        dest.preallocate(10).unwrap();
        dest.write_at(0, b"0123456789").unwrap();
        dest.finalize().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");

        let mut dest = PartFile::create(dir.path().join("cut.bin")).unwrap();
        dest.write_at(0, b"abcdef").unwrap();
        dest.truncate(2).unwrap();
        dest.finalize().unwrap();
        assert_eq!(std::fs::read(dir.path().join("cut.bin")).unwrap(), b"ab");
    }

    #[test]
    fn memory_destination_grows() {
        let mut dest = MemoryDestination::default();
        dest.write_at(3, b"de").unwrap();
        dest.write_at(0, b"abc").unwrap();
        assert_eq!(dest.bytes, b"abcde");
        dest.truncate(4).unwrap();
        assert_eq!(dest.bytes, b"abcd");
        dest.finalize().unwrap();
        assert!(dest.finalized);
    }
}

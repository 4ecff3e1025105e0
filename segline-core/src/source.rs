//! Byte sources a producer serves from.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// Random-access bytes of one resource.
pub trait ByteSource: Send {
    fn size(&self) -> u64;

    /// Read up to `len` bytes at `offset`. A short read only happens at the end.
    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Version stamped into segment names, if the source has one.
    fn version(&self) -> Option<u64> {
        None
    }
}

impl ByteSource for Vec<u8> {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.len());
        let end = start.saturating_add(len).min(self.len());
        Ok(self[start..end].to_vec())
    }
}

impl<T: ByteSource + ?Sized> ByteSource for Box<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        (**self).read_at(offset, len)
    }

    fn version(&self) -> Option<u64> {
        (**self).version()
    }
}

/// File on disk; the version is its modification time in seconds.
pub struct FileSource {
    file: File,
    path: PathBuf,
    size: u64,
    version: Option<u64>,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let meta = file.metadata()?;
        let version = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        Ok(Self {
            file,
            path,
            size: meta.len(),
            version,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let want = (self.size.saturating_sub(offset)).min(len as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            #[cfg(unix)]
            let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            #[cfg(windows)]
            let n = self.file.seek_read(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn version(&self) -> Option<u64> {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn vec_reads_clamp_to_end() {
        let mut src = b"0123456789".to_vec();
        assert_eq!(src.read_at(2, 3).unwrap(), b"234");
        assert_eq!(src.read_at(8, 100).unwrap(), b"89");
        assert!(src.read_at(10, 4).unwrap().is_empty());
        assert!(src.read_at(u64::MAX, 4).unwrap().is_empty());
        assert_eq!(src.version(), None);
    }

    #[test]
    fn file_source_reads_and_versions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello file source").unwrap();
        file.flush().unwrap();

        let mut src = FileSource::open(file.path()).unwrap();
        assert_eq!(src.size(), 17);
        assert!(src.version().is_some());
        assert_eq!(src.read_at(6, 4).unwrap(), b"file");
        assert_eq!(src.read_at(12, 100).unwrap(), b"source");
        assert!(src.read_at(40, 1).unwrap().is_empty());
    }
}

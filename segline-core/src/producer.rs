//! Producer side: answers segment requests for one resource from a byte source.

use tracing::{debug, warn};

use crate::chunk;
use crate::integrity;
use crate::name::{Component, Name};
use crate::protocol::{Reply, ResourceMeta, Response};
use crate::source::ByteSource;

pub struct ChunkProducer<S> {
    name: Name,
    source: S,
    chunk_size: u64,
}

impl<S: ByteSource> ChunkProducer<S> {
    /// Serve `source` under `name` (a bare name) in chunks of `chunk_size` bytes.
    pub fn new(name: Name, source: S, chunk_size: u64) -> Self {
        Self {
            name: name.without_segment(),
            source,
            chunk_size: chunk::effective_chunk_size(chunk_size),
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Highest valid segment index; `-1` for an empty source.
    pub fn final_segment(&self) -> i64 {
        chunk::final_segment(self.source.size(), self.chunk_size)
    }

    /// Bytes of segment `n`, or `None` when `n` lies past the end of the source.
    pub fn get_chunk(&mut self, n: u64) -> std::io::Result<Option<Vec<u8>>> {
        let Some(offset) = chunk::segment_offset(n, self.chunk_size) else {
            return Ok(None);
        };
        if offset >= self.source.size() {
            return Ok(None);
        }
        self.source
            .read_at(offset, self.chunk_size as usize)
            .map(Some)
    }

    /// Answer a request for this producer's resource.
    ///
    /// A request without a segment component is answered as segment 0 under the
    /// fully qualified name and carries the resource metadata.
    pub fn on_request(&mut self, request: &Name) -> Response {
        let final_segment = self.final_segment();
        let (name, segment, meta) = match request.segment() {
            Some(n) => (request.clone(), n, None),
            None => {
                let mut qualified = request.clone();
                if let Some(v) = self.source.version() {
                    if request.version().is_none() {
                        qualified.push(Component::Version(v));
                    }
                }
                let meta = ResourceMeta {
                    total_size: self.source.size(),
                    version: self.source.version(),
                };
                (qualified.append(Component::Segment(0)), 0, Some(meta))
            }
        };

        let reply = match self.get_chunk(segment) {
            Ok(Some(payload)) => Reply::Data {
                digest: integrity::digest(&payload),
                payload,
            },
            Ok(None) => {
                debug!(%name, final_segment, "segment out of range");
                Reply::Nack
            }
            Err(e) => {
                warn!(%name, error = %e, "reading segment failed");
                Reply::Nack
            }
        };
        Response {
            name,
            final_segment,
            meta,
            reply,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Versioned(Vec<u8>);

    impl ByteSource for Versioned {
        fn size(&self) -> u64 {
            self.0.size()
        }
        fn read_at(&mut self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
            self.0.read_at(offset, len)
        }
        fn version(&self) -> Option<u64> {
            Some(42)
        }
    }

    fn producer(len: usize, chunk: u64) -> ChunkProducer<Vec<u8>> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        ChunkProducer::new(Name::from("/test/file"), data, chunk)
    }

    #[test]
    fn empty_source_has_no_segments() {
        let mut p = producer(0, 4096);
        assert_eq!(p.final_segment(), -1);
        assert_eq!(p.get_chunk(0).unwrap(), None);
        let r = p.on_request(&Name::from("/test/file"));
        assert!(r.is_nack());
        assert_eq!(r.final_segment, -1);
        assert_eq!(r.meta.unwrap().total_size, 0);
    }

    #[test]
    fn small_source_is_one_segment() {
        let mut p = producer(12, 4096);
        assert_eq!(p.final_segment(), 0);
        assert_eq!(p.get_chunk(0).unwrap().unwrap().len(), 12);
        assert_eq!(p.get_chunk(1).unwrap(), None);
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_segment() {
        let mut p = producer(8192, 4096);
        assert_eq!(p.final_segment(), 1);
        assert_eq!(p.get_chunk(1).unwrap().unwrap().len(), 4096);
        assert_eq!(p.get_chunk(2).unwrap(), None);
    }

    #[test]
    fn last_segment_is_short() {
        let mut p = producer(40_000, 4096);
        assert_eq!(p.final_segment(), 9);
        assert_eq!(p.get_chunk(9).unwrap().unwrap().len(), 40_000 - 9 * 4096);
    }

    #[test]
    fn bare_request_is_segment_zero_with_meta() {
        let mut p = ChunkProducer::new(Name::from("/test/file"), Versioned(vec![7; 10]), 4);
        let r = p.on_request(&Name::from("/test/file"));
        assert_eq!(r.name.to_string(), "/test/file/v=42/seg=0");
        assert_eq!(r.segment(), Some(0));
        assert_eq!(r.final_segment, 2);
        assert_eq!(
            r.meta,
            Some(ResourceMeta {
                total_size: 10,
                version: Some(42)
            })
        );
        match r.reply {
            Reply::Data { payload, digest } => {
                assert_eq!(payload, vec![7; 4]);
                assert!(integrity::verify(&payload, &digest));
            }
            Reply::Nack => panic!("expected data"),
        }
    }

    #[test]
    fn explicit_version_is_not_duplicated() {
        let mut p = ChunkProducer::new(Name::from("/test/file"), Versioned(vec![1; 3]), 4);
        let r = p.on_request(&Name::from("/test/file/v=42"));
        assert_eq!(r.name.to_string(), "/test/file/v=42/seg=0");
    }

    #[test]
    fn out_of_range_is_nack_not_panic() {
        let mut p = producer(100, 10);
        let r = p.on_request(&Name::from("/test/file/seg=10"));
        assert!(r.is_nack());
        assert_eq!(r.final_segment, 9);
        assert!(r.meta.is_none());
        assert!(p.on_request(&Name::from("/test/file").with_segment(u64::MAX)).is_nack());
    }
}

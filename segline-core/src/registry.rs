//! Producer registry: routes inbound requests to the producer with the longest
//! matching name prefix.

use tracing::{debug, info};

use crate::name::Name;
use crate::producer::ChunkProducer;
use crate::protocol::Response;
use crate::source::ByteSource;

pub type BoxedProducer = ChunkProducer<Box<dyn ByteSource>>;

#[derive(Default)]
pub struct ProducerRegistry {
    producers: Vec<BoxedProducer>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer; one already registered under the same name is replaced.
    pub fn register(&mut self, producer: BoxedProducer) {
        info!(name = %producer.name(), final_segment = producer.final_segment(), "producer registered");
        self.producers.retain(|p| p.name() != producer.name());
        self.producers.push(producer);
    }

    /// Convenience for `register(ChunkProducer::new(..))`.
    pub fn serve(&mut self, name: Name, source: impl ByteSource + 'static, chunk_size: u64) {
        self.register(ChunkProducer::new(name, Box::new(source), chunk_size));
    }

    pub fn unregister(&mut self, name: &Name) -> Option<BoxedProducer> {
        let idx = self.producers.iter().position(|p| p.name() == name)?;
        Some(self.producers.swap_remove(idx))
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Answer `request`, or `None` when no producer's name is a prefix of it.
    pub fn dispatch(&mut self, request: &Name) -> Option<Response> {
        let producer = self
            .producers
            .iter_mut()
            .filter(|p| p.name().is_prefix_of(request))
            .max_by_key(|p| p.name().len());
        match producer {
            Some(p) => Some(p.on_request(request)),
            None => {
                debug!(%request, "no producer for request");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut reg = ProducerRegistry::new();
        reg.serve(Name::from("/data"), b"short".to_vec(), 4096);
        reg.serve(Name::from("/data/big"), vec![9u8; 10_000], 4096);

        let r = reg.dispatch(&Name::from("/data/big/seg=2")).unwrap();
        assert_eq!(r.final_segment, 2);
        let r = reg.dispatch(&Name::from("/data/seg=0")).unwrap();
        assert_eq!(r.final_segment, 0);
    }

    #[test]
    fn unmatched_request_is_dropped() {
        let mut reg = ProducerRegistry::new();
        reg.serve(Name::from("/data"), b"x".to_vec(), 4096);
        assert!(reg.dispatch(&Name::from("/other/seg=0")).is_none());
        assert!(reg.dispatch(&Name::from("/dat")).is_none());
    }

    #[test]
    fn register_replaces_same_name() {
        let mut reg = ProducerRegistry::new();
        reg.serve(Name::from("/a"), b"one".to_vec(), 4096);
        reg.serve(Name::from("/a"), vec![0u8; 5000], 4096);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.dispatch(&Name::from("/a")).unwrap().final_segment, 1);

        assert!(reg.unregister(&Name::from("/a")).is_some());
        assert!(reg.is_empty());
        assert!(reg.unregister(&Name::from("/a")).is_none());
    }
}

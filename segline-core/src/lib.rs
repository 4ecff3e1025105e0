//! Segmented, resumable content transfer.
//! Host-driven: no I/O loop; the host passes transport events in and gets consumer events back.

pub mod batch;
pub mod chunk;
pub mod consumer;
pub mod destination;
pub mod integrity;
pub mod name;
pub mod producer;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod segments;
pub mod source;
pub mod transport;
pub mod wire;

pub use batch::Batch;
pub use chunk::DEFAULT_CHUNK_SIZE;
pub use consumer::{
    AllowGrowth, ChunkConsumer, ConsumerEvent, ConsumerOptions, Phase, ResizePolicy, Strict,
    TransferError, DEFAULT_PIPELINE_DEPTH,
};
pub use destination::{Destination, MemoryDestination, PartFile};
pub use name::{Component, Name};
pub use producer::ChunkProducer;
pub use protocol::{Packet, Reply, ResourceMeta, Response};
pub use registry::ProducerRegistry;
pub use segments::{SegmentState, SegmentTable, SegmentTableError};
pub use source::{ByteSource, FileSource};
pub use transport::{RequestHandle, TransportAdapter, TransportEvent};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};

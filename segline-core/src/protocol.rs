//! Segment protocol: responses, NACKs and the packets carried by stream bridges.

use serde::{Deserialize, Serialize};

use crate::name::Name;

/// Resource metadata carried by the answer to a bare-name request, so a consumer
/// can discover the size and version of what it is fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub total_size: u64,
    pub version: Option<u64>,
}

/// Payload of a response. A NACK means "no data for this segment" and is expected
/// steady-state traffic, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Segment bytes and their SHA-256 digest.
    Data { payload: Vec<u8>, digest: [u8; 32] },
    Nack,
}

/// Producer answer to one segment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Fully-qualified name, including the segment component.
    pub name: Name,
    /// Highest valid segment index; `-1` for an empty resource. Constant for a resource.
    pub final_segment: i64,
    /// Present only on answers to bare-name requests.
    pub meta: Option<ResourceMeta>,
    pub reply: Reply,
}

impl Response {
    pub fn segment(&self) -> Option<u64> {
        self.name.segment()
    }

    pub fn is_nack(&self) -> bool {
        matches!(self.reply, Reply::Nack)
    }
}

/// Everything a stream bridge carries. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Request for a name; `handle` is chosen by the requester and echoed in the response.
    Request { handle: u64, name: Name },
    /// Answer to the request identified by `handle`.
    Response { handle: u64, response: Response },
}

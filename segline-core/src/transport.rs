//! Transport seam. The core never does I/O itself: it asks a [`TransportAdapter`]
//! to send, and the host feeds outcomes back as [`TransportEvent`]s.

use crate::name::Name;
use crate::protocol::Response;

/// Identifies one outstanding request; chosen by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// Request/respond capability provided by a transport.
///
/// Outcomes of `request` arrive later as [`TransportEvent::Response`] or
/// [`TransportEvent::Timeout`] on a channel the host owns, in delivery order.
pub trait TransportAdapter {
    fn request(&mut self, name: &Name) -> RequestHandle;

    /// Stop waiting for `handle`. A cancelled handle produces no further events.
    fn cancel(&mut self, handle: RequestHandle);

    /// Answer an inbound request.
    fn respond(&mut self, response: Response);
}

impl<T: TransportAdapter + ?Sized> TransportAdapter for &mut T {
    fn request(&mut self, name: &Name) -> RequestHandle {
        (**self).request(name)
    }

    fn cancel(&mut self, handle: RequestHandle) {
        (**self).cancel(handle)
    }

    fn respond(&mut self, response: Response) {
        (**self).respond(response)
    }
}

/// What a transport delivers to the host's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Inbound request for something we may produce.
    Request { name: Name },
    /// Answer to one of our requests.
    Response {
        handle: RequestHandle,
        request: Name,
        response: Response,
    },
    /// No answer in time.
    Timeout { handle: RequestHandle, request: Name },
}

//! Outbound replies
//!
//! Envelopes, the shared delivery queue, the pacing coordinator and the
//! transport seam to the mesh radio.

pub mod delivery;
pub mod envelope;
pub mod queue;
pub mod transport;

pub use delivery::{delivery_loop, DeliverySettings};
pub use envelope::{EnvelopeId, NodeNum, ReplyEnvelope};
pub use queue::{DeliveryQueue, DeliveryStats, EnqueueReport, OverflowPolicy, QueueError};
pub use transport::{JsonLinesTransport, MeshTransport, TransportError};

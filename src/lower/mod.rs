//! Lower transport layer.
//!
//! Segments Upper Transport PDUs that do not fit a single Network PDU,
//! reassembles inbound segments and runs the Block Ack and retransmission
//! timers of both directions.

mod layer;
mod outbound;
mod pdu;
mod reassembly;

pub use layer::{InboundAccessPdu, LowerEvent, LowerTransportLayer, OutboundAccessPdu, OutboundPdu};
pub use pdu::{LowerTransportPdu, SegmentAcknowledgment, SegmentHeader};
pub use reassembly::seq_auth;

//! Client-side networking library for voxel game servers speaking a sequenced,
//! reliable UDP protocol.
//!
//! The protocol multiplexes three independent reliable byte streams over a
//! single UDP flow, with an initial sequence-number exchange, per-packet
//! acknowledgments, retransmission on timeout and keep-alive liveness
//! detection. The [`net::app::Connection`] structure is the entry point.

pub mod util;
pub mod net;

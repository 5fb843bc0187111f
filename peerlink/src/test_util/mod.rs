//! Test utilities for driving the link without kernel access
//!
//! In-memory stand-ins for the routing table, the overlay transport and
//! the virtual interface, each recording what was done to it and able to
//! fail on demand.

pub mod interface;
pub mod route_table;
pub mod transport;

pub use interface::{ChannelReader, ChannelWriter, InterfaceHandle, channel_interface};
pub use route_table::MemoryRouteTable;
pub use transport::{MemoryTransport, TransportHandle};

//! Link layer of a user-space network stack.
//!
//! Receives raw frames from network devices, demultiplexes them to the
//! protocol registered for their EtherType, resolves next-hop link
//! addresses (queueing frames while a resolution is in flight), and picks
//! egress interfaces by longest-prefix match. Components talk exclusively
//! through bounded FIFO queues; each device and each dispatch loop runs as
//! its own worker thread.
//!
//! [`link::LinkLayer`] is the composition root: hand it devices, optional
//! extra protocol handlers, and resolution protocols, then `start()`.

pub mod device;
pub mod error;
pub mod ethernet;
pub mod frame;
pub mod link;
pub mod neighbor;
pub mod queue;
pub mod registry;
pub mod routing;
pub mod stats;
pub mod test_util;

pub use device::{Device, DeviceHandle, InterfaceAddr, Loopback, TapDevice};
pub use error::{ConfigError, LinkError};
pub use frame::{Delivery, Frame, SendRequest};
pub use link::{LinkLayer, LinkLayerBuilder};
pub use neighbor::{
    AddressFamily, NeighborCache, NeighborConfig, NeighborResolver, NeighborStatus, Resolution,
};
pub use registry::{LinkProtocol, ProtocolRegistry};
pub use routing::{NextHop, Route, RoutingTable};
pub use stats::{LinkStats, StatsSnapshot};

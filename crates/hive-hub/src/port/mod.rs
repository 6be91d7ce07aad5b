//! Host-wide port coordination between agents.

mod registry;

pub use registry::{
    AcquireRequest, AcquireResponse, AcquireStatus, CONTROL_SERVICE, PortError, PortLease,
    PortRegistry, PortState, PortStatus, PortWaiter,
};

//! IP address planning module.
//!
//! This module holds the address arithmetic, the discovery of networks
//! already in use on the host and the controller, and the allocator that
//! splits pools and searches for free blocks.

pub mod allocator;
pub mod cidr;
pub mod discovery;

// Re-export commonly used types
pub use allocator::{AddressClass, AllocationError, AllocationPlan, NetworkAllocator, VpnPoolSplit};
pub use cidr::{AddressError, AddressRange, CidrBlock};
pub use discovery::{DiscoverySource, ExistingNetworkSet};

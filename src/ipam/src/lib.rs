pub mod allocator;
pub mod bitset;
pub mod error;
pub mod ip;
pub mod operation;
pub mod port;

pub use allocator::Allocator;
pub use ip::IpAllocator;
pub use operation::Operation;
pub use port::{PortAllocator, PortRange};

pub mod allocator;
pub mod cidr;

pub use allocator::{mac_for_ip, AddressAllocator};
pub use cidr::{parse_cidr, CidrConfig, ExcludeSet};

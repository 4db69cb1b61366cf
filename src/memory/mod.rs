pub mod allocator;
pub mod cache;
pub mod d2d;
pub mod descriptor;
pub mod guard;
pub mod kernel;
pub mod mapping;
pub mod registry;
pub mod router;
pub mod transfer;
pub mod validator;
pub mod width;

// Re-export the types most callers touch
pub use descriptor::{DeviceMem, DeviceMemU64, MemKind, MemoryDescriptor};
pub use mapping::DeviceMapping;
pub use registry::{AllocationRecord, AllocationRegistry};
pub use router::{CdmaEngine, Route};
pub use width::SizeWidth;

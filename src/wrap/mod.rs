//! Higher-level wrappings of RDMA resources.

pub mod registered_mem;

pub use self::registered_mem::*;

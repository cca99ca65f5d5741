//! An RDMA-backed RPC runtime consisting of a safe RDMA wrapping layer and
//! a request/response calling convention built on top of it.
//!
//! Low-level, mostly-safe wrappers of RDMA resources and data-plane verbs
//! live in the [`rdma`] mod (re-exported at the crate root). The [`rpc`]
//! mod builds the actual calling convention on top of them: buffer-page
//! arenas, a wait-free context ring, a completion poller, a bounded worker
//! pool, and the [`rpc::Client`]/[`rpc::Server`] façades.
//!
//! TCP-based connection bootstrapping utilities (used to exchange queue
//! pair endpoints and remote memory handles before the RDMA connection is
//! brought up) live in the [`ctrl`] mod. Some higher-level wrappings of
//! RDMA resources are in the [`wrap`] mod.
//!
//! **WARNING: The interfaces are unstable and up to change!**
//!
//! # Example
//!
//! This example runs a tiny echo server and calls it once.
//!
//! ```rust,no_run
#![doc = include_str!("../demos/echo.rs")]
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("this crate currently only supports Linux");

/// Bindings of C interfaces.
pub mod bindings;

/// Shared utility functions.
mod utils;

/// RDMA functionalities.
/// Not to be publicly exposed, instead `pub use` necessary items.
mod rdma;

pub use rdma::context::*;
pub use rdma::cq::*;
pub use rdma::gid::*;
pub use rdma::mr::*;
pub use rdma::nic::*;
pub use rdma::pd::*;
pub use rdma::qp::*;
pub use rdma::wr::*;

/// Type aliases and re-exports for RDMA-related operations.
pub use rdma::type_alias as types;

/// Connection management utilities.
pub mod ctrl;

/// Higher-level wrappings of RDMA resources.
pub mod wrap;

/// The RPC runtime: transport, buffer arenas, context state machines,
/// the completion poller, the worker pool, and the client/server façade.
pub mod rpc;

/// Commonly used items, re-exported for convenient `use rrddmma::prelude::*`.
pub mod prelude;

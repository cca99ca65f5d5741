//! The RDMA RPC prelude.
//!
//! The purpose of this module is to alleviate imports of common
//! functionalities, both from the RDMA wrapping layer and the RPC runtime
//! built on top of it.

pub use crate::rdma::context::Context;
pub use crate::rdma::cq::{Cq, Wc, WcOpcode, WcStatus};
pub use crate::rdma::gid::{Gid, GidType, GidTyped};
pub use crate::rdma::mr::{Mr, MrRemote, MrSlice, Permission, Slicing};
pub use crate::rdma::nic::{Nic, NicFinder, Port};
pub use crate::rdma::pd::Pd;
pub use crate::rdma::qp::{Qp, QpBuilder, QpCaps, QpEndpoint, QpPeer, QpState, QpType};
pub use crate::rdma::wr::*;

pub use crate::rpc::{Client, HandlerTable, RpcConfig, RpcError, RpcStatus, Server};

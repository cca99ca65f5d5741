//! The RPC runtime built on top of the RDMA wrapping layer: buffer-page
//! arenas, the wait-free context ring, the per-slot state machine, the
//! completion poller, the server's worker pool, and the `Client`/`Server`
//! façades.
//!
//! Module layout mirrors spec §2's bottom-up component list: [`transport`]
//! is the leaf verb wrapper, [`arena`] the pinned buffer pool, [`context`]
//! the per-slot state machine, [`ring`] the wait-free free-list/task queue,
//! [`connection`] the per-connection datapath, [`poller`] the background
//! completion-polling loop, [`workerpool`] the server's bounded worker set,
//! and [`client`]/[`server`] the public façades. [`header`], [`status`] and
//! [`config`] hold the wire format, error taxonomy and tunables shared by
//! all of the above.

mod arena;
mod client;
mod config;
mod connection;
mod context;
mod handler;
mod header;
mod poller;
mod ring;
mod server;
mod status;
mod transport;
mod workerpool;

pub use client::Client;
pub use config::RpcConfig;
pub use context::ContextState;
pub use handler::HandlerTable;
pub use header::{make_ctx_id, split_ctx_id, MessageHeader, MessageType, HEADER_SIZE};
pub use ring::Ring;
pub use server::Server;
pub use status::{RpcError, RpcStatus};
pub use transport::{Completion, CompletionKind, MockTransport, PostedOp, RdmaTransport, Transport};

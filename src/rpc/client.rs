//! The client façade: resolves connections and dispatches calls (spec §4.8).

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use crate::ctrl::Connecter;
use crate::rdma::cq::Cq;
use crate::rdma::nic::Nic;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps, QpEndpoint, QpType};

use super::arena::Arena;
use super::connection::Connection;
use super::poller::CompletionPoller;
use super::status::{RpcError, RpcStatus};
use super::transport::RdmaTransport;
use super::RpcConfig;

/// Owns a NIC/protection-domain pair, a completion poller, and the set of
/// connections this process has opened as a caller.
pub struct Client {
    nic: Nic,
    pd: Pd,
    poller: CompletionPoller,
    connections: Mutex<HashMap<u32, Arc<Connection>>>,
    next_conn_id: AtomicU16,
    config: RpcConfig,
}

impl Client {
    /// Probe the first available RDMA-capable NIC and bring up a
    /// protection domain and completion poller, using default tunables.
    pub fn new() -> RpcStatus<Self> {
        Self::with_config(RpcConfig::default())
    }

    pub fn with_config(config: RpcConfig) -> RpcStatus<Self> {
        config.validate()?;
        let nic = Nic::finder().probe()?;
        let pd = Pd::new(&nic.context)?;
        Ok(Self {
            nic,
            pd,
            poller: CompletionPoller::start(),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU16::new(0),
            config,
        })
    }

    /// Connect to `host:port`, performing the TCP handshake and bringing
    /// the queue pair up to RTS, and return an opaque connection id.
    pub fn connect(&self, host: &str, port: u16) -> RpcStatus<u32> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RpcError::ConfigError(format!("unresolvable address {host}:{port}")))?;
        let connecter = Connecter::connect(addr)?;

        let cq = Cq::new(&self.nic.context, self.config.cq_cap)?;
        let mut qp = Qp::builder()
            .qp_type(QpType::Rc)
            .caps(QpCaps {
                max_send_wr: self.config.cq_cap,
                max_recv_wr: self.config.cq_cap,
                ..QpCaps::default()
            })
            .send_cq(&cq)
            .recv_cq(&cq)
            .sq_sig_all(false)
            .build(&self.pd)?;

        let port = self
            .nic
            .ports
            .first()
            .ok_or_else(|| RpcError::ConfigError("NIC has no usable port".into()))?;
        qp.bind_local_port(port, None)?;
        let local_ep = QpEndpoint::new(&qp)
            .ok_or_else(|| RpcError::ConfigError("queue pair has no bound port".into()))?;

        let arena = Arena::new(&self.pd, self.config.page_size, self.config.n_ctx)?;

        let local = (local_ep, arena.rkey());
        let (peer_ep, peer_rkey): (QpEndpoint, u32) = connecter.exchange(&local)?;

        qp.bind_peer(peer_ep)?;

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new_caller(
            conn_id,
            Box::new(RdmaTransport::new(qp)),
            arena,
            peer_rkey,
            self.config,
        );
        self.poller.register(Arc::clone(&conn));
        self.connections.lock().unwrap().insert(conn_id as u32, conn);
        Ok(conn_id as u32)
    }

    /// Issue an RPC and block until the response arrives (or the call
    /// fails).
    pub fn call(&self, conn_id: u32, rpc_id: u32, req: &[u8]) -> RpcStatus<Vec<u8>> {
        let conn = self
            .connections
            .lock()
            .unwrap()
            .get(&conn_id)
            .cloned()
            .ok_or_else(|| RpcError::ConfigError(format!("unknown connection id {conn_id}")))?;
        conn.call(rpc_id, req)
    }

    /// Tear down a connection, returning its resources. Per spec §5,
    /// callers must ensure no `call` is outstanding on it.
    pub fn disconnect(&self, conn_id: u32) {
        if let Some(conn) = self.connections.lock().unwrap().remove(&conn_id) {
            self.poller.deregister(conn.id());
        }
    }
}

//! The server façade: accepts connections and dispatches requests to
//! registered handlers (spec §4.8).

use std::collections::HashMap;
use std::net::{TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ctrl::Connecter;
use crate::rdma::cq::Cq;
use crate::rdma::nic::Nic;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps, QpEndpoint, QpType};

use super::arena::Arena;
use super::connection::Connection;
use super::handler::HandlerTable;
use super::poller::CompletionPoller;
use super::status::{RpcError, RpcStatus};
use super::transport::RdmaTransport;
use super::workerpool::WorkerPool;
use super::RpcConfig;

/// Owns the listening socket, the shared handler table and worker pool, and
/// every connection accepted so far.
pub struct Server {
    nic: Nic,
    pd: Pd,
    listener: TcpListener,
    handlers: Arc<HandlerTable>,
    workers: Arc<WorkerPool>,
    poller: CompletionPoller,
    connections: Mutex<HashMap<u32, Arc<Connection>>>,
    next_conn_id: AtomicU16,
    config: RpcConfig,
    running: Arc<AtomicBool>,
}

impl Server {
    pub fn new(host: &str, port: u16) -> RpcStatus<Self> {
        Self::with_config(host, port, RpcConfig::default())
    }

    pub fn with_config(host: &str, port: u16, config: RpcConfig) -> RpcStatus<Self> {
        config.validate()?;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RpcError::ConfigError(format!("unresolvable address {host}:{port}")))?;
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let nic = Nic::finder().probe()?;
        let pd = Pd::new(&nic.context)?;
        let handlers = Arc::new(HandlerTable::new());
        let workers = Arc::new(WorkerPool::new(config.worker_count, config.n_ctx as u32));

        Ok(Self {
            nic,
            pd,
            listener,
            handlers,
            workers,
            poller: CompletionPoller::start(),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU16::new(0),
            config,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Register a handler for `rpc_id`; rejects duplicate registrations.
    /// Must be called before [`Server::run`] (spec §5: "written only before
    /// `run()`; read-only thereafter").
    pub fn register_handler(
        &self,
        rpc_id: u32,
        f: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> RpcStatus<()> {
        self.handlers.register(rpc_id, f)
    }

    /// Signal [`Server::run`]'s accept loop to exit. Safe to call from any
    /// thread, including a signal handler the embedder installs itself.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Accept connections and dispatch requests until [`Server::stop`] is
    /// called. Returns a process exit code.
    pub fn run(&self) -> RpcStatus<i32> {
        while self.running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = self.accept_connection(stream) {
                        log::error!("failed to bring up accepted connection: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(0)
    }

    fn accept_connection(&self, stream: std::net::TcpStream) -> RpcStatus<()> {
        let connecter = Connecter::from_accepted(stream)?;

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
        let conn = Connection::new_handler(
            conn_id,
            Box::new(RdmaTransport::new(qp)),
            arena,
            peer_rkey,
            self.config,
            Arc::clone(&self.handlers),
            Arc::clone(&self.workers),
        );
        self.poller.register(Arc::clone(&conn));
        self.connections.lock().unwrap().insert(conn_id as u32, conn);
        Ok(())
    }
}

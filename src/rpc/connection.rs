//! One RDMA-backed connection: queue-pair, arena, context pool, and the
//! caller-side `call` entry point.
//!
//! Grounded on spec §4.5. Contexts hold a non-owning back-pointer to their
//! `Connection`; the cycle is broken the way `wrap::RegisteredMem` already
//! breaks its own self-reference — by building through `Arc::new_cyclic`
//! rather than any unsafe transmute of an unrelated kind (spec §9's
//! "Cyclic references" note).

use std::io;
use std::sync::Arc;

use crate::rdma::mr::MrRemote;
use crate::rpc::header::HEADER_SIZE;

use super::arena::Arena;
use super::context::Context;
use super::handler::HandlerTable;
use super::ring::Ring;
use super::status::RpcStatus;
use super::transport::{Completion, CompletionKind, Transport};
use super::workerpool::WorkerPool;
use super::RpcConfig;

/// Handler-role-only state: the shared table of user callbacks and the
/// worker pool that runs them off the poller thread.
struct Dispatch {
    handlers: Arc<HandlerTable>,
    workers: Arc<WorkerPool>,
}

/// One fabric connection and everything needed to drive RPCs over it.
pub struct Connection {
    id: u16,
    transport: Box<dyn Transport>,
    arena: Arena,
    contexts: Vec<Box<Context>>,
    /// Free-context pool. `Some` only on the caller side (spec §4.5: "Caller
    /// side: push all contexts onto the free ring. Server side: immediately
    /// pre-post a Recv for each context").
    free_ring: Option<Ring<*mut Context>>,
    dispatch: Option<Dispatch>,
    /// Remote key of the peer's arena, learned once during the connection
    /// handshake and read-only from then on.
    peer_rkey: u32,
    config: RpcConfig,
}

// SAFETY: `Connection` is shared across the poller thread, worker threads,
// and caller threads; all mutable state lives behind its own
// synchronization (`Context`'s mutex, the ring's atomics).
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    fn build(
        id: u16,
        transport: Box<dyn Transport>,
        arena: Arena,
        peer_rkey: u32,
        config: RpcConfig,
        dispatch: Option<Dispatch>,
        pre_post_recv: bool,
    ) -> Arc<Connection> {
        let n_ctx = config.n_ctx;
        Arc::new_cyclic(|weak| {
            let contexts: Vec<Box<Context>> =
                (0..n_ctx).map(|slot| Box::new(Context::new(id, slot))).collect();
            for ctx in &contexts {
                ctx.bind(weak.as_ptr() as *mut Connection);
            }

            let free_ring = if dispatch.is_none() {
                let ring = Ring::new(n_ctx as u32);
                for ctx in &contexts {
                    ring.push(ctx.as_ref() as *const Context as *mut Context);
                }
                Some(ring)
            } else {
                None
            };

            Connection {
                id,
                transport,
                arena,
                contexts,
                free_ring,
                dispatch,
                peer_rkey,
                config,
            }
        })
        .tap_pre_post(pre_post_recv)
    }

    /// Construct a caller-role connection: all contexts start Vacant, in the
    /// free ring.
    pub fn new_caller(
        id: u16,
        transport: Box<dyn Transport>,
        arena: Arena,
        peer_rkey: u32,
        config: RpcConfig,
    ) -> Arc<Connection> {
        Self::build(id, transport, arena, peer_rkey, config, None, false)
    }

    /// Construct a handler-role connection: every context immediately
    /// pre-posts a Recv and waits for a request.
    pub fn new_handler(
        id: u16,
        transport: Box<dyn Transport>,
        arena: Arena,
        peer_rkey: u32,
        config: RpcConfig,
        handlers: Arc<HandlerTable>,
        workers: Arc<WorkerPool>,
    ) -> Arc<Connection> {
        Self::build(
            id,
            transport,
            arena,
            peer_rkey,
            config,
            Some(Dispatch { handlers, workers }),
            true,
        )
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    pub(crate) fn config(&self) -> &RpcConfig {
        &self.config
    }

    fn context(&self, slot: u16) -> &Context {
        &self.contexts[slot as usize]
    }

    fn context_by_id(&self, ctx_id: u32) -> Option<&Context> {
        let (_, slot) = super::header::split_ctx_id(ctx_id);
        self.contexts.get(slot as usize).map(|b| b.as_ref())
    }

    /// Caller-side entry point: `call(rpc_id, request) -> response`.
    pub fn call(&self, rpc_id: u32, req: &[u8]) -> RpcStatus<Vec<u8>> {
        let ring = self
            .free_ring
            .as_ref()
            .expect("call() is only valid on a caller-role connection");
        let ctx = unsafe { &*ring.pop() };
        let result = (|| {
            ctx.start_call(rpc_id, req)?;
            Ok(ctx.wait_for_result())
        })();
        // Whatever the outcome, the context must return to Vacant/free.
        ring.push(ctx as *const Context as *mut Context);
        match result {
            Ok(inner) => inner,
            Err(e) => Err(e),
        }
    }

    // ---- Verb posting helpers, called by `Context` ----------------------

    pub(crate) fn post_recv(&self, ctx: &Context) -> io::Result<()> {
        let slice = self.arena.page(ctx.slot());
        self.transport.post_recv(slice, ctx.tag())
    }

    pub(crate) fn post_send(&self, ctx: &Context, len: usize) -> io::Result<()> {
        let slice = self.arena.page_region(ctx.slot(), 0, len);
        self.transport.post_send(slice, ctx.tag(), None, false)
    }

    pub(crate) fn post_read_request(&self, ctx: &Context, msg_len: u32) -> io::Result<()> {
        let local = self
            .arena
            .page_region(ctx.slot(), HEADER_SIZE, msg_len as usize);
        let remote_addr = ctx.inner.lock().unwrap().remote_addr;
        let remote = MrRemote::new(remote_addr + HEADER_SIZE as u64, msg_len as usize, self.peer_rkey);
        self.transport.post_read(local, remote, ctx.tag())
    }

    pub(crate) fn post_write_response(
        &self,
        ctx: &Context,
        total_len: usize,
        imm: u32,
    ) -> io::Result<()> {
        let local = self.arena.page_region(ctx.slot(), 0, total_len);
        let remote_addr = ctx.inner.lock().unwrap().remote_addr;
        let remote = MrRemote::new(remote_addr, total_len, self.peer_rkey);
        self.transport.post_write_imm(local, remote, imm, ctx.tag())
    }

    pub(crate) fn dispatch_to_worker(&self, ctx: &Context) {
        let dispatch = self
            .dispatch
            .as_ref()
            .expect("request dispatch is only valid on a handler-role connection");
        dispatch
            .workers
            .submit(ctx as *const Context as *mut Context);
    }

    /// Run `rpc_id`'s registered handler for `ctx` and drive the response
    /// write. Invoked by a worker thread, never the poller.
    pub(crate) fn run_handler(&self, ctx: &Context) {
        let dispatch = self.dispatch.as_ref().expect("handler-role connection");
        let req = ctx.request_bytes();
        let resp = dispatch.handlers.dispatch(ctx.rpc_id(), &req);
        if let Err(e) = ctx.finish_handler(&resp) {
            log::error!("ctx {}: failed to post response: {e}", ctx.ctx_id());
        }
    }

    /// Drain and dispatch up to `batch` completions from this connection's
    /// transport. Called by the completion poller.
    pub(crate) fn poll_and_advance(&self, batch: u32) -> io::Result<usize> {
        let completions = self.transport.poll_completions(batch)?;
        let n = completions.len();
        for comp in completions {
            self.route_completion(comp);
        }
        Ok(n)
    }

    fn route_completion(&self, comp: Completion) {
        let received = unsafe { &*(comp.ctx_tag as *const Context) };
        if comp.kind == CompletionKind::Recv {
            if let Some(imm) = comp.imm {
                match self.context_by_id(imm) {
                    Some(target) => target.complete_response(received, comp),
                    None => log::warn!("recv-with-imm {imm:#x}: no matching context"),
                }
                return;
            }
        }
        received.advance(comp);
    }
}

/// Small helper so `build` can optionally pre-post every context's initial
/// Recv once the `Arc` (and therefore every context's back-pointer) is
/// fully constructed.
trait PrePost {
    fn tap_pre_post(self, pre_post_recv: bool) -> Self;
}

impl PrePost for Arc<Connection> {
    fn tap_pre_post(self, pre_post_recv: bool) -> Self {
        if pre_post_recv {
            for ctx in &self.contexts {
                if let Err(e) = self.post_recv(ctx) {
                    log::error!("failed to pre-post recv for ctx {}: {e}", ctx.ctx_id());
                }
                ctx.inner.lock().unwrap().state = super::context::ContextState::WaitingForBufferMeta;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::context::ContextState;
    use crate::rpc::transport::{MockTransport, PostedOp};
    use crate::rpc::header::{make_ctx_id, MessageHeader, MessageType};
    use crate::rdma::cq::WcStatus;
    use crate::rdma::nic::Nic;
    use crate::rdma::pd::Pd;

    fn test_pd() -> Option<Pd> {
        let nic = Nic::finder().probe().ok()?;
        Pd::new(&nic.context).ok()
    }

    fn send_ok(ctx_tag: u64) -> Completion {
        Completion {
            ctx_tag,
            kind: CompletionKind::Send,
            imm: None,
            status: Ok(0),
        }
    }

    fn recv_with_imm(ctx_tag: u64, imm: u32, bytes: usize) -> Completion {
        Completion {
            ctx_tag,
            kind: CompletionKind::Recv,
            imm: Some(imm),
            status: Ok(bytes),
        }
    }

    /// Write a `Response` header plus payload directly into a caller's own
    /// page, standing in for what the handler's write-with-immediate would
    /// have deposited there over the wire.
    fn deposit_response(conn: &Connection, slot: u16, rpc_id: u32, payload: &[u8]) {
        let header = MessageHeader {
            remote_addr: 0,
            msg_len: payload.len() as u32,
            ctx_id: make_ctx_id(conn.id(), slot),
            rpc_id,
            ty: MessageType::Response as u32,
        };
        let page_size = conn.arena().page_size();
        // SAFETY: test-only direct poke of a page no concurrent verb is
        // touching, standing in for the peer's RDMA write.
        let page =
            unsafe { std::slice::from_raw_parts_mut(conn.arena().page_ptr(slot), page_size) };
        header.write_into(page);
        page[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
    }

    #[test]
    fn free_ring_starts_with_every_context() {
        let Some(pd) = test_pd() else {
            eprintln!("skipping: no RDMA-capable NIC available");
            return;
        };
        let config = RpcConfig { n_ctx: 4, ..RpcConfig::default() };
        let arena = Arena::new(&pd, config.page_size, config.n_ctx).unwrap();
        let conn = Connection::new_caller(0, Box::new(MockTransport::new()), arena, 0, config);
        assert_eq!(conn.free_ring.as_ref().unwrap().len(), 4);
    }

    /// Property 6 (size split) and property 7 (round-trip identity, large
    /// side): a request above `imm_request_size` must still carry its
    /// payload into the page even though the Send only covers the header,
    /// since the handler's one-sided Read depends on it already being
    /// there (S2). Regression test for the bug where the payload copy was
    /// gated behind the ImmRequest fast path.
    #[test]
    fn large_request_still_carries_payload_for_handlers_read() {
        let Some(pd) = test_pd() else {
            eprintln!("skipping: no RDMA-capable NIC available");
            return;
        };
        let config = RpcConfig {
            n_ctx: 2,
            page_size: 256,
            imm_request_size: 32,
            ..RpcConfig::default()
        };
        let arena = Arena::new(&pd, config.page_size, config.n_ctx).unwrap();
        let mock = Arc::new(MockTransport::new());
        let conn = Connection::new_caller(1, Box::new(mock.clone()), arena, 0xdead, config);

        let small = conn.context(0);
        let large = conn.context(1);

        let small_req = vec![0xABu8; 8];
        small.start_call(5, &small_req).unwrap();
        let large_req = vec![0x42u8; 100];
        large.start_call(6, &large_req).unwrap();

        let posted = mock.posted();
        let ops_for = |tag: u64| -> Vec<PostedOp> {
            posted.iter().copied().filter(|op| op.ctx_tag == tag).collect()
        };

        // Small (ImmRequest): Recv for the response, then a Send carrying
        // header + payload together.
        let small_ops = ops_for(small.tag());
        assert_eq!(small_ops.len(), 2);
        assert_eq!(small_ops[0].kind, CompletionKind::Recv);
        assert_eq!(small_ops[1].kind, CompletionKind::Send);
        assert_eq!(small_ops[1].len, HEADER_SIZE + small_req.len());

        // Large (Request): Recv, then a header-only Send — no Read is ever
        // posted by the caller side; that's the handler's job.
        let large_ops = ops_for(large.tag());
        assert_eq!(large_ops.len(), 2);
        assert_eq!(large_ops[0].kind, CompletionKind::Recv);
        assert_eq!(large_ops[1].kind, CompletionKind::Send);
        assert_eq!(large_ops[1].len, HEADER_SIZE);

        // But the payload itself must already be sitting in the page,
        // since a real handler would Read it from there.
        // SAFETY: no concurrent verb references this page in the test.
        let page = unsafe {
            std::slice::from_raw_parts(conn.arena().page_ptr(1), config.page_size)
        };
        assert_eq!(&page[HEADER_SIZE..HEADER_SIZE + large_req.len()], &large_req[..]);
    }

    /// Property 5 (response isolation) and S4 (out-of-order completion
    /// delivery): when context A's response-bearing recv completes on
    /// context B's pre-posted WR (the "carrier"), the payload must come
    /// from A's own page — where the handler's write-with-immediate
    /// actually deposited it — not from B's. Regression test for the bug
    /// where `complete_response` read the carrier's page instead of its
    /// own.
    #[test]
    fn out_of_order_response_is_read_from_the_right_page() {
        let Some(pd) = test_pd() else {
            eprintln!("skipping: no RDMA-capable NIC available");
            return;
        };
        let config = RpcConfig { n_ctx: 2, page_size: 128, ..RpcConfig::default() };
        let arena = Arena::new(&pd, config.page_size, config.n_ctx).unwrap();
        let mock = Arc::new(MockTransport::new());
        let conn = Connection::new_caller(2, Box::new(mock.clone()), arena, 0, config);

        let ctx_a = conn.context(0);
        let ctx_b = conn.context(1);

        ctx_a.start_call(10, b"req-a").unwrap();
        ctx_b.start_call(11, b"req-b").unwrap();
        // Drive both Sends to completion so each context is WaitingForResponse.
        ctx_a.advance(send_ok(ctx_a.tag()));
        ctx_b.advance(send_ok(ctx_b.tag()));

        // Each context's response has landed in its own page (as a real
        // write-with-immediate would deposit it), but the recv completion
        // that surfaces it arrives on the *other* context's pre-posted WR.
        deposit_response(&conn, ctx_a.slot(), 10, b"resp-a");
        deposit_response(&conn, ctx_b.slot(), 11, b"resp-b");

        conn.route_completion(recv_with_imm(ctx_b.tag(), ctx_a.ctx_id(), 6));
        assert_eq!(ctx_a.state(), ContextState::Vacant);
        assert_eq!(ctx_b.state(), ContextState::WaitingForResponse);

        conn.route_completion(recv_with_imm(ctx_a.tag(), ctx_b.ctx_id(), 6));
        assert_eq!(ctx_b.state(), ContextState::Vacant);

        {
            let mut inner_a = ctx_a.inner.lock().unwrap();
            assert_eq!(inner_a.result.take().unwrap().unwrap(), b"resp-a".to_vec());
        }
        {
            let mut inner_b = ctx_b.inner.lock().unwrap();
            assert_eq!(inner_b.result.take().unwrap().unwrap(), b"resp-b".to_vec());
        }
    }

    #[test]
    fn failed_completion_latches_an_error_instead_of_stale_data() {
        let Some(pd) = test_pd() else {
            eprintln!("skipping: no RDMA-capable NIC available");
            return;
        };
        let config = RpcConfig { n_ctx: 1, page_size: 128, ..RpcConfig::default() };
        let arena = Arena::new(&pd, config.page_size, config.n_ctx).unwrap();
        let mock = Arc::new(MockTransport::new());
        let conn = Connection::new_caller(3, Box::new(mock.clone()), arena, 0, config);
        let ctx = conn.context(0);

        ctx.start_call(1, b"ping").unwrap();
        ctx.advance(send_ok(ctx.tag()));
        let failure = Completion {
            ctx_tag: ctx.tag(),
            kind: CompletionKind::Recv,
            imm: Some(ctx.ctx_id()),
            status: Err(WcStatus::RetryExcErr),
        };
        conn.route_completion(failure);

        assert_eq!(ctx.state(), ContextState::Vacant);
        let mut inner = ctx.inner.lock().unwrap();
        assert!(inner.result.take().unwrap().is_err());
    }
}

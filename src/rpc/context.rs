//! The per-slot RPC state machine.
//!
//! Grounded on spec §4.3's caller/handler transition tables. A single
//! [`Context`] type serves both roles: which table applies falls out of
//! which state the context is currently in, so there is no separate
//! caller/handler enum — matching the "prefer the enum [for the *state*],
//! not a trait with two implementors" guidance of spec §9, taken one step
//! further since the state already disambiguates role.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Condvar, Mutex};

use crate::rdma::cq::WcStatus;

use super::header::{make_ctx_id, split_ctx_id, MessageHeader, MessageType, HEADER_SIZE};
use super::status::{RpcError, RpcStatus};
use super::transport::{Completion, CompletionKind};
use super::connection::Connection;

/// Where a context currently sits in its request/response lifecycle.
///
/// `Vacant` contexts are (and only are) present in the connection's free
/// ring; every other state means "owned, with at most one verb posted on
/// its behalf outstanding" (spec §3's "at-most-one posting" invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Vacant,
    SendingBufferMeta,
    WaitingForResponse,
    WaitingForBufferMeta,
    ReadingRequest,
    FilledWithRequest,
    FilledWithResponse,
    WritingResponse,
}

pub(crate) struct Inner {
    pub state: ContextState,
    pub rpc_id: u32,
    pub msg_len: u32,
    /// `header.remote_addr` learned from the inbound request; the address a
    /// handler's response must be written back to.
    pub remote_addr: u64,
    /// `header.ctx_id` learned from the inbound request (handler role only):
    /// the *caller's* context id, echoed back unchanged in the response
    /// header and as the write-with-immediate's `imm32`.
    pub caller_ctx_id: u32,
    /// Latched terminal result, consumed by the blocked caller thread when
    /// it wakes and finds `state == Vacant`.
    pub result: Option<RpcStatus<Vec<u8>>>,
}

/// One RPC slot: a dedicated arena page plus a state-machine cursor.
///
/// `conn` is a non-owning back-pointer (spec §9, "Cyclic references"):
/// a `Context` never outlives the `Connection` that allocated it, so the
/// pointer is written once during construction and only ever read after.
pub struct Context {
    slot: u16,
    ctx_id: u32,
    conn: AtomicPtr<Connection>,
    pub(crate) inner: Mutex<Inner>,
    cond: Condvar,
}

impl Context {
    pub(crate) fn new(conn_id: u16, slot: u16) -> Self {
        Self {
            slot,
            ctx_id: make_ctx_id(conn_id, slot),
            conn: AtomicPtr::new(std::ptr::null_mut()),
            inner: Mutex::new(Inner {
                state: ContextState::Vacant,
                rpc_id: 0,
                msg_len: 0,
                remote_addr: 0,
                caller_ctx_id: 0,
                result: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Bind the back-pointer. Called exactly once, from `Connection::new`
    /// (via `Arc::new_cyclic`), before the context is reachable from any
    /// other thread.
    pub(crate) fn bind(&self, conn: *mut Connection) {
        self.conn.store(conn, Ordering::Release);
    }

    #[inline]
    pub fn slot(&self) -> u16 {
        self.slot
    }

    #[inline]
    pub fn ctx_id(&self) -> u32 {
        self.ctx_id
    }

    /// The tag used as `wr_id` on every verb posted on this context's
    /// behalf: its own address. `Transport::poll_completions` round-trips
    /// it unexamined.
    #[inline]
    pub fn tag(&self) -> u64 {
        self as *const Self as u64
    }

    #[inline]
    pub fn rpc_id(&self) -> u32 {
        self.inner.lock().unwrap().rpc_id
    }

    /// Run this context's handler and drive the response write. Called by a
    /// worker thread after `Connection::dispatch_to_worker` hands it off.
    pub(crate) fn run_handler(&self) {
        self.conn().run_handler(self);
    }

    fn conn(&self) -> &Connection {
        let ptr = self.conn.load(Ordering::Acquire);
        debug_assert!(!ptr.is_null(), "context used before its connection was bound");
        // SAFETY: the back-pointer is bound once before publication and the
        // Connection always outlives its contexts.
        unsafe { &*ptr }
    }

    pub(crate) fn state(&self) -> ContextState {
        self.inner.lock().unwrap().state
    }

    // ---- Caller-side driving (invoked by `Connection::call`) ----------

    /// Vacant -> SendingBufferMeta: write header+payload into the page,
    /// pre-post a Recv for the response, then Send the request.
    pub(crate) fn start_call(&self, rpc_id: u32, req: &[u8]) -> RpcStatus<()> {
        let conn = self.conn();
        let page_size = conn.arena().page_size();
        if HEADER_SIZE + req.len() > page_size {
            return Err(RpcError::MessageTooLarge {
                len: req.len(),
                page_size,
            });
        }

        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.state, ContextState::Vacant);
            inner.rpc_id = rpc_id;
            inner.msg_len = req.len() as u32;
            inner.result = None;
            inner.state = ContextState::SendingBufferMeta;
        }

        let imm_fast_path = req.len() <= conn.config().imm_request_size;
        let ty = if imm_fast_path {
            MessageType::ImmRequest
        } else {
            MessageType::Request
        };
        let header = MessageHeader {
            remote_addr: conn.arena().page_ptr(self.slot) as u64,
            msg_len: req.len() as u32,
            ctx_id: self.ctx_id,
            rpc_id,
            ty: ty as u32,
        };

        // SAFETY: this slot is exclusively ours while checked out.
        let page = unsafe {
            std::slice::from_raw_parts_mut(conn.arena().page_ptr(self.slot), page_size)
        };
        header.write_into(page);
        // Written unconditionally: the non-imm path sends only the header,
        // but the handler's subsequent one-sided Read still fetches the
        // payload from here, so it must already be in place before the Send.
        page[HEADER_SIZE..HEADER_SIZE + req.len()].copy_from_slice(req);

        conn.post_recv(self)?;
        let send_len = if imm_fast_path {
            HEADER_SIZE + req.len()
        } else {
            HEADER_SIZE
        };
        conn.post_send(self, send_len)?;
        Ok(())
    }

    /// Block the calling thread until this context's call completes,
    /// returning the response or a latched error.
    pub(crate) fn wait_for_result(&self) -> RpcStatus<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        while inner.state != ContextState::Vacant {
            inner = self.cond.wait(inner).unwrap();
        }
        inner.result.take().expect("Vacant context must carry a latched result")
    }

    // ---- Poller-driven transitions --------------------------------------

    /// Drive this context's own state machine for a completion whose
    /// `wr_id` tagged it directly (i.e. not a response-by-immediate, which
    /// `Connection::route_completion` handles separately).
    pub(crate) fn advance(&self, comp: Completion) {
        let conn = self.conn();
        let mut inner = self.inner.lock().unwrap();
        match (inner.state, comp.kind) {
            (ContextState::SendingBufferMeta, CompletionKind::Send) => {
                if comp.is_success() {
                    inner.state = ContextState::WaitingForResponse;
                } else {
                    self.latch_failure(&mut inner, comp);
                }
            }
            (ContextState::WaitingForResponse, CompletionKind::Recv) => {
                // Our own pre-posted recv buffer was consumed by someone
                // else's response (imm != our ctx_id); nothing to do here,
                // `Connection::route_completion` already delivered our own
                // response (if any) to whichever context owns it.
                if !comp.is_success() {
                    self.latch_failure(&mut inner, comp);
                }
            }
            (ContextState::WaitingForBufferMeta, CompletionKind::Recv) => {
                if !comp.is_success() {
                    log::warn!("ctx {}: recv failed, re-posting", self.ctx_id);
                    drop(inner);
                    let _ = conn.post_recv(self);
                    return;
                }
                // SAFETY: our page, exclusively ours between recvs.
                let page = unsafe {
                    std::slice::from_raw_parts(
                        conn.arena().page_ptr(self.slot),
                        conn.arena().page_size(),
                    )
                };
                let header = MessageHeader::read_from(page);
                inner.rpc_id = header.rpc_id;
                inner.msg_len = header.msg_len;
                inner.remote_addr = header.remote_addr;
                inner.caller_ctx_id = header.ctx_id;
                match header.message_type() {
                    MessageType::ImmRequest => {
                        inner.state = ContextState::FilledWithRequest;
                        drop(inner);
                        conn.dispatch_to_worker(self);
                    }
                    MessageType::Request => {
                        inner.state = ContextState::ReadingRequest;
                        drop(inner);
                        let _ = conn.post_read_request(self, header.msg_len);
                    }
                    other => {
                        log::warn!("ctx {}: unexpected message type {:?}", self.ctx_id, other);
                    }
                }
            }
            (ContextState::ReadingRequest, CompletionKind::Read) => {
                if comp.is_success() {
                    inner.state = ContextState::FilledWithRequest;
                    drop(inner);
                    conn.dispatch_to_worker(self);
                } else {
                    log::warn!("ctx {}: read failed, re-posting recv", self.ctx_id);
                    inner.state = ContextState::WaitingForBufferMeta;
                    drop(inner);
                    let _ = conn.post_recv(self);
                }
            }
            (ContextState::WritingResponse, CompletionKind::Write) => {
                inner.state = ContextState::WaitingForBufferMeta;
                drop(inner);
                let _ = conn.post_recv(self);
            }
            (state, kind) => {
                log::warn!(
                    "ctx {}: unexpected completion {:?} in state {:?}",
                    self.ctx_id,
                    kind,
                    state
                );
            }
        }
    }

    /// This context is the *logical* owner (by `imm32`) of a response whose
    /// completion happened to surface on `carrier`'s pre-posted recv (the one
    /// next in QP-FIFO order, generally *not* `self`). The data itself was
    /// deposited by the handler's write-with-immediate at `self`'s own page
    /// address, which is what the original request header advertised as
    /// `remote_addr` — so it is read from here, not from `carrier`. Copy it
    /// out, latch it, and wake the blocked caller.
    pub(crate) fn complete_response(&self, carrier: &Context, comp: Completion) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ContextState::WaitingForResponse {
            log::warn!(
                "ctx {}: response delivered while in state {:?}",
                self.ctx_id,
                inner.state
            );
            return;
        }
        if !comp.is_success() {
            self.latch_failure(&mut inner, comp);
            return;
        }
        log::trace!(
            "ctx {}: response demuxed off carrier slot {}",
            self.ctx_id,
            carrier.slot
        );
        let conn = self.conn();
        // SAFETY: our page, exclusively ours while WaitingForResponse.
        let page = unsafe {
            std::slice::from_raw_parts(
                conn.arena().page_ptr(self.slot),
                conn.arena().page_size(),
            )
        };
        let header = MessageHeader::read_from(page);
        let (_, slot) = split_ctx_id(header.ctx_id);
        debug_assert_eq!(slot, self.slot, "immediate demux must match embedded ctx_id");
        let payload = page[HEADER_SIZE..HEADER_SIZE + header.msg_len as usize].to_vec();
        inner.result = Some(Ok(payload));
        inner.state = ContextState::Vacant;
        drop(inner);
        self.cond.notify_all();
    }

    fn latch_failure(&self, inner: &mut Inner, comp: Completion) {
        let status = comp.status.unwrap_err_or(WcStatus::GeneralErr);
        inner.result = Some(Err(RpcError::CallFailure(format!(
            "completion failed: {status:?}"
        ))));
        inner.state = ContextState::Vacant;
        self.cond.notify_all();
    }

    // ---- Worker-side driving (handler role) -----------------------------

    /// Current request payload, valid only while `state == FilledWithRequest`.
    pub(crate) fn request_bytes(&self) -> Vec<u8> {
        let conn = self.conn();
        let inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state, ContextState::FilledWithRequest);
        // SAFETY: exclusively ours until the response is posted.
        let page = unsafe {
            std::slice::from_raw_parts(conn.arena().page_ptr(self.slot), conn.arena().page_size())
        };
        page[HEADER_SIZE..HEADER_SIZE + inner.msg_len as usize].to_vec()
    }

    /// FilledWithRequest -> WritingResponse: rewrite the page with the
    /// response and post a Write-with-immediate back to the caller.
    pub(crate) fn finish_handler(&self, response: &[u8]) -> RpcStatus<()> {
        let conn = self.conn();
        let page_size = conn.arena().page_size();
        if HEADER_SIZE + response.len() > page_size {
            return Err(RpcError::MessageTooLarge {
                len: response.len(),
                page_size,
            });
        }

        let (remote_addr, caller_ctx_id, rpc_id) = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.state, ContextState::FilledWithRequest);
            inner.state = ContextState::FilledWithResponse;
            (inner.remote_addr, inner.caller_ctx_id, inner.rpc_id)
        };

        let header = MessageHeader {
            remote_addr,
            msg_len: response.len() as u32,
            ctx_id: caller_ctx_id,
            rpc_id,
            ty: MessageType::Response as u32,
        };
        // SAFETY: exclusively ours while WritingResponse is pending.
        let page = unsafe {
            std::slice::from_raw_parts_mut(conn.arena().page_ptr(self.slot), page_size)
        };
        header.write_into(page);
        page[HEADER_SIZE..HEADER_SIZE + response.len()].copy_from_slice(response);

        self.inner.lock().unwrap().state = ContextState::WritingResponse;
        conn.post_write_response(self, HEADER_SIZE + response.len(), caller_ctx_id)
    }
}

trait UnwrapErrOr<T> {
    fn unwrap_err_or(self, default: T) -> T;
}

impl<T> UnwrapErrOr<T> for Result<usize, T> {
    fn unwrap_err_or(self, default: T) -> T {
        match self {
            Ok(_) => default,
            Err(e) => e,
        }
    }
}

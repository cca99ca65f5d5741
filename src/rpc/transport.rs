//! The transport surface: a thin, safe wrapper over the fabric's
//! post-send/post-recv/post-read/post-write-with-immediate verbs and
//! completion polling.
//!
//! Grounded on spec §4.1 and `rdma::qp::Qp`'s `recv`/`send`/`read`/`write`
//! methods, which this module's [`RdmaTransport`] forwards to almost
//! verbatim. The [`Transport`] trait is the seam that lets the context
//! state machine (§4.3) and the connection datapath (§4.5) be driven by a
//! software [`MockTransport`] in tests, without any RDMA-capable hardware.

use std::io;
use std::sync::Mutex;

use crate::rdma::cq::{Wc, WcOpcode, WcStatus};
use crate::rdma::mr::{MrRemote, MrSlice, Slicing};
use crate::rdma::qp::Qp;

/// What kind of verb a [`Completion`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Send,
    Recv,
    Read,
    Write,
}

/// A transport-agnostic work completion: enough information for [`Context::advance`]
/// (see `rpc::context`) to run the state-transition table of spec §4.3
/// without touching `ibv_wc` directly.
///
/// [`Context::advance`]: crate::rpc::context::Context::advance
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Round-trips the `wr_id` passed to whichever `post_*` call produced
    /// this completion; this crate always sets it to a [`Context`](crate::rpc::context::Context)'s
    /// address.
    pub ctx_tag: u64,
    pub kind: CompletionKind,
    /// Present only on `Recv`/`RecvRdmaImm` completions that actually carry
    /// an immediate (i.e. a peer's Write-with-immediate landed here).
    pub imm: Option<u32>,
    pub status: Result<usize, WcStatus>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }
}

/// The narrow, policy-free interface the connection datapath drives.
///
/// All operations enqueue a verb; per spec §4.1, failures here are
/// considered fatal configuration errors, not part of the datapath's error
/// taxonomy (`RpcError::CallFailure` is reserved for *completion* failures).
pub trait Transport: Send + Sync {
    fn post_recv(&self, local: MrSlice<'_>, ctx_tag: u64) -> io::Result<()>;

    fn post_send(
        &self,
        local: MrSlice<'_>,
        ctx_tag: u64,
        imm: Option<u32>,
        inline: bool,
    ) -> io::Result<()>;

    fn post_read(&self, local: MrSlice<'_>, remote: MrRemote, ctx_tag: u64) -> io::Result<()>;

    fn post_write_imm(
        &self,
        local: MrSlice<'_>,
        remote: MrRemote,
        imm: u32,
        ctx_tag: u64,
    ) -> io::Result<()>;

    /// Non-blockingly drain up to `max` completions.
    fn poll_completions(&self, max: u32) -> io::Result<Vec<Completion>>;
}

/// The real transport: a reliable-connected queue pair with a single
/// completion queue shared by its send and receive sides (spec §4.1: "one
/// completion queue (shared by send/recv)").
pub struct RdmaTransport {
    qp: Qp,
}

impl RdmaTransport {
    pub fn new(qp: Qp) -> Self {
        Self { qp }
    }

    pub fn qp(&self) -> &Qp {
        &self.qp
    }
}

impl Transport for RdmaTransport {
    fn post_recv(&self, local: MrSlice<'_>, ctx_tag: u64) -> io::Result<()> {
        self.qp.recv(&[local], ctx_tag)
    }

    fn post_send(
        &self,
        local: MrSlice<'_>,
        ctx_tag: u64,
        imm: Option<u32>,
        inline: bool,
    ) -> io::Result<()> {
        self.qp.send(&[local], None, imm, ctx_tag, true, inline)
    }

    fn post_read(&self, local: MrSlice<'_>, remote: MrRemote, ctx_tag: u64) -> io::Result<()> {
        self.qp.read(&[local], &remote, ctx_tag, true)
    }

    fn post_write_imm(
        &self,
        local: MrSlice<'_>,
        remote: MrRemote,
        imm: u32,
        ctx_tag: u64,
    ) -> io::Result<()> {
        self.qp.write(&[local], &remote, ctx_tag, Some(imm), true)
    }

    fn poll_completions(&self, max: u32) -> io::Result<Vec<Completion>> {
        let wcs = self.qp.scq().poll_some(max)?;
        Ok(wcs.iter().map(wc_to_completion).collect())
    }
}

fn wc_to_completion(wc: &Wc) -> Completion {
    let kind = match wc.opcode() {
        WcOpcode::Send => CompletionKind::Send,
        WcOpcode::Recv => CompletionKind::Recv,
        WcOpcode::RecvRdmaImm => CompletionKind::Recv,
        WcOpcode::RdmaRead => CompletionKind::Read,
        WcOpcode::RdmaWrite => CompletionKind::Write,
        // Unknown/unused opcodes for this datapath: fold into `Send` so the
        // caller's match still terminates; `advance` logs and ignores
        // anything it doesn't recognize for its current state (spec §7).
        _ => CompletionKind::Send,
    };
    Completion {
        ctx_tag: wc.wr_id(),
        kind,
        imm: wc.imm(),
        status: wc.ok(),
    }
}

/// A posted-but-uncompleted verb, recorded by [`MockTransport`] so tests can
/// assert property 3 ("at-most-one posting") and property 6 (the size-split
/// path) without real hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedOp {
    pub ctx_tag: u64,
    pub kind: CompletionKind,
    pub len: usize,
}

/// A software stand-in for [`RdmaTransport`], used by the `rpc::context` and
/// `rpc::connection` unit tests. Records every posted verb and lets the test
/// feed back synthetic completions via [`MockTransport::complete`].
#[derive(Default)]
pub struct MockTransport {
    posted: Mutex<Vec<PostedOp>>,
    pending: Mutex<Vec<Completion>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All verbs posted so far, in posting order.
    pub fn posted(&self) -> Vec<PostedOp> {
        self.posted.lock().unwrap().clone()
    }

    /// Queue a completion to be returned by the next `poll_completions`.
    pub fn complete(&self, ctx_tag: u64, kind: CompletionKind, imm: Option<u32>, bytes: usize) {
        self.pending.lock().unwrap().push(Completion {
            ctx_tag,
            kind,
            imm,
            status: Ok(bytes),
        });
    }

    /// Queue a failed completion.
    pub fn fail(&self, ctx_tag: u64, kind: CompletionKind, status: WcStatus) {
        self.pending.lock().unwrap().push(Completion {
            ctx_tag,
            kind,
            imm: None,
            status: Err(status),
        });
    }

    fn record(&self, ctx_tag: u64, kind: CompletionKind, len: usize) {
        self.posted.lock().unwrap().push(PostedOp { ctx_tag, kind, len });
    }
}

impl Transport for MockTransport {
    fn post_recv(&self, local: MrSlice<'_>, ctx_tag: u64) -> io::Result<()> {
        self.record(ctx_tag, CompletionKind::Recv, local.len());
        Ok(())
    }

    fn post_send(
        &self,
        local: MrSlice<'_>,
        ctx_tag: u64,
        _imm: Option<u32>,
        _inline: bool,
    ) -> io::Result<()> {
        self.record(ctx_tag, CompletionKind::Send, local.len());
        Ok(())
    }

    fn post_read(&self, local: MrSlice<'_>, _remote: MrRemote, ctx_tag: u64) -> io::Result<()> {
        self.record(ctx_tag, CompletionKind::Read, local.len());
        Ok(())
    }

    fn post_write_imm(
        &self,
        local: MrSlice<'_>,
        _remote: MrRemote,
        _imm: u32,
        ctx_tag: u64,
    ) -> io::Result<()> {
        self.record(ctx_tag, CompletionKind::Write, local.len());
        Ok(())
    }

    fn poll_completions(&self, max: u32) -> io::Result<Vec<Completion>> {
        let mut pending = self.pending.lock().unwrap();
        let n = (max as usize).min(pending.len());
        Ok(pending.drain(..n).collect())
    }
}

/// Lets a test share one [`MockTransport`] between a `Connection` (which
/// takes ownership of a `Box<dyn Transport>`) and the test body itself (which
/// needs to call `posted()`/`complete()`/`fail()` on it afterwards).
#[cfg(test)]
impl Transport for std::sync::Arc<MockTransport> {
    fn post_recv(&self, local: MrSlice<'_>, ctx_tag: u64) -> io::Result<()> {
        (**self).post_recv(local, ctx_tag)
    }

    fn post_send(
        &self,
        local: MrSlice<'_>,
        ctx_tag: u64,
        imm: Option<u32>,
        inline: bool,
    ) -> io::Result<()> {
        (**self).post_send(local, ctx_tag, imm, inline)
    }

    fn post_read(&self, local: MrSlice<'_>, remote: MrRemote, ctx_tag: u64) -> io::Result<()> {
        (**self).post_read(local, remote, ctx_tag)
    }

    fn post_write_imm(
        &self,
        local: MrSlice<'_>,
        remote: MrRemote,
        imm: u32,
        ctx_tag: u64,
    ) -> io::Result<()> {
        (**self).post_write_imm(local, remote, imm, ctx_tag)
    }

    fn poll_completions(&self, max: u32) -> io::Result<Vec<Completion>> {
        (**self).poll_completions(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_records_posted_ops_in_order() {
        let t = MockTransport::new();
        // MrSlice needs a live Mr; exercised end-to-end via rpc::connection
        // tests instead. Here we only check the completion queue plumbing.
        t.complete(42, CompletionKind::Send, None, 8);
        t.complete(43, CompletionKind::Recv, Some(7), 16);

        let wcs = t.poll_completions(10).unwrap();
        assert_eq!(wcs.len(), 2);
        assert_eq!(wcs[0].ctx_tag, 42);
        assert!(wcs[0].is_success());
        assert_eq!(wcs[1].imm, Some(7));
    }

    #[test]
    fn mock_poll_respects_max_batch() {
        let t = MockTransport::new();
        for i in 0..5 {
            t.complete(i, CompletionKind::Send, None, 0);
        }
        let first = t.poll_completions(2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = t.poll_completions(10).unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn mock_fail_reports_status() {
        let t = MockTransport::new();
        t.fail(1, CompletionKind::Send, WcStatus::RetryExcErr);
        let wcs = t.poll_completions(1).unwrap();
        assert_eq!(wcs[0].status, Err(WcStatus::RetryExcErr));
    }
}

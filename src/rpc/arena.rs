//! Fixed-size page arena backing a connection's contexts.
//!
//! Grounded on `wrap::RegisteredMem`, whose own doc comment already
//! documents the "leak a `Box`, hand back a `'static` reference" trick this
//! module reuses to give `Arena` a free-standing, lifetime-free owner: each
//! `Arena` leaks its own private clone of the connection's `Pd` so that the
//! `RegisteredMem` it owns can be `'static`, and therefore `Arena` itself can
//! be moved and stored as an ordinary field with no borrow to thread through.
//!
//! Spec §4.2: one contiguous registered buffer per connection, split into
//! `n_ctx` pages of `page_size` bytes, one page per context.

use std::io;

use crate::rdma::mr::{MrRemote, MrSlice, Slicing};
use crate::rdma::pd::Pd;
use crate::wrap::RegisteredMem;

/// Owns the registered memory backing one connection's contexts.
pub struct Arena {
    mem: RegisteredMem<'static>,
    page_size: usize,
    n_ctx: u16,
}

impl Arena {
    /// Register `n_ctx * page_size` bytes of memory with `pd`.
    ///
    /// `pd` is cloned (a cheap `Arc` bump, see `Pd::clone`) and leaked so the
    /// registered memory can outlive any borrow of the caller's `Pd`.
    pub fn new(pd: &Pd, page_size: usize, n_ctx: u16) -> io::Result<Self> {
        let pd: &'static Pd = Box::leak(Box::new(pd.clone()));
        let total = page_size * n_ctx as usize;
        let mem = RegisteredMem::new(pd, total)?;
        Ok(Self {
            mem,
            page_size,
            n_ctx,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn n_ctx(&self) -> u16 {
        self.n_ctx
    }

    /// Local key of the arena's single underlying memory region.
    pub fn lkey(&self) -> u32 {
        self.mem.mr().lkey()
    }

    /// Remote key of the arena's single underlying memory region, sent to
    /// the peer during the connection handshake (spec §6).
    pub fn rkey(&self) -> u32 {
        self.mem.mr().rkey()
    }

    /// Borrow the `slot`-th page as a local slice, valid to post as the
    /// local side of a send/recv/read/write.
    pub fn page(&self, slot: u16) -> MrSlice<'_> {
        assert!(slot < self.n_ctx, "context slot out of range");
        let offset = slot as usize * self.page_size;
        self.mem
            .slice(offset, self.page_size)
            .expect("slot offset within arena bounds")
    }

    /// Remote descriptor for the `slot`-th page, to be sent to a peer so it
    /// can Read from or Write into this page.
    pub fn remote_page(&self, slot: u16) -> MrRemote {
        assert!(slot < self.n_ctx, "context slot out of range");
        let offset = slot as usize * self.page_size;
        let base = self.mem.mr().as_remote();
        MrRemote::new(base.addr + offset as u64, self.page_size, base.rkey)
    }

    /// Borrow `len` bytes starting at `offset` within the `slot`-th page.
    /// Used to post a verb on something shorter than a full page (a
    /// header-only Send, or a sub-page Read/Write).
    pub fn page_region(&self, slot: u16, offset: usize, len: usize) -> MrSlice<'_> {
        assert!(slot < self.n_ctx, "context slot out of range");
        assert!(offset + len <= self.page_size, "region exceeds page bounds");
        let base = slot as usize * self.page_size + offset;
        self.mem
            .slice(base, len)
            .expect("region within arena bounds")
    }

    /// Raw pointer to the start of the `slot`-th page, for direct reads of a
    /// freshly-completed recv/read without re-deriving an `MrSlice`.
    pub fn page_ptr(&self, slot: u16) -> *mut u8 {
        assert!(slot < self.n_ctx, "context slot out of range");
        let offset = slot as usize * self.page_size;
        // SAFETY: offset is within the arena's registered region.
        unsafe { self.mem.addr().add(offset) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::nic::Nic;

    fn test_pd() -> Option<Pd> {
        let nic = Nic::finder().probe().ok()?;
        Pd::new(&nic.context).ok()
    }

    #[test]
    fn pages_are_disjoint_and_sized() {
        let Some(pd) = test_pd() else {
            eprintln!("skipping: no RDMA-capable NIC available");
            return;
        };
        let arena = Arena::new(&pd, 256, 4).unwrap();
        for slot in 0..4u16 {
            let page = arena.page(slot);
            assert_eq!(page.len(), 256);
        }
        let p0 = arena.page_ptr(0) as usize;
        let p1 = arena.page_ptr(1) as usize;
        assert_eq!(p1 - p0, 256);
    }
}

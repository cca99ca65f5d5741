//! The server's `rpc_id -> callback` dispatch table.
//!
//! Grounded on spec §3 ("Server... owns... a HandlerTable (map from rpc_id
//! to user callback)") and §5's concurrency model: "written only before
//! `run()`; read-only thereafter." Modeled as a `RwLock`-guarded map rather
//! than a true write-once cell since `register_handler` may be called
//! multiple times before `run()`.

use std::collections::HashMap;
use std::sync::RwLock;

use super::status::{RpcError, RpcStatus};

type Callback = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<u32, Callback>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `rpc_id`. Rejects a duplicate registration
    /// (spec §4.8: "rejects duplicates").
    pub fn register(
        &self,
        rpc_id: u32,
        f: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> RpcStatus<()> {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&rpc_id) {
            return Err(RpcError::ConfigError(format!(
                "handler for rpc_id {rpc_id} already registered"
            )));
        }
        handlers.insert(rpc_id, Box::new(f));
        Ok(())
    }

    /// Run `rpc_id`'s handler on `req`, or an empty response if none is
    /// registered (logged, not fatal — mirrors the "unknown opcodes are
    /// logged and ignored" policy of spec §7 for unrecognized dispatch).
    pub fn dispatch(&self, rpc_id: u32, req: &[u8]) -> Vec<u8> {
        let handlers = self.handlers.read().unwrap();
        match handlers.get(&rpc_id) {
            Some(f) => f(req),
            None => {
                log::warn!("no handler registered for rpc_id {rpc_id}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_to_registered_handler() {
        let table = HandlerTable::new();
        table.register(0, |req: &[u8]| req.to_vec()).unwrap();
        assert_eq!(table.dispatch(0, b"hello"), b"hello");
    }

    #[test]
    fn rejects_duplicate_registration() {
        let table = HandlerTable::new();
        table.register(1, |_: &[u8]| Vec::new()).unwrap();
        assert!(table.register(1, |_: &[u8]| Vec::new()).is_err());
    }

    #[test]
    fn unregistered_rpc_id_returns_empty() {
        let table = HandlerTable::new();
        assert_eq!(table.dispatch(42, b"x"), Vec::<u8>::new());
    }
}

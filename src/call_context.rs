//! The block memory manager: block table, call stack, and variable store.
//!
//! `CallContext` is the only place bytes legally cross the host/guest
//! boundary. It has no `wasmtime` dependency of its own — the ABI functions
//! that the guest actually links against live in [`crate::abi`], which reads
//! wasm-linear-memory bytes and forwards them into the methods here. Keeping
//! the two separate lets the allocator/stack/variable invariants (§8 of
//! SPEC_FULL.md) be tested directly, without standing up a `wasmtime::Store`.

use std::collections::HashMap;

use crate::address::{self, NULL_INDEX};
use crate::error::{Error, Result};
use crate::logging::LogSink;

const PAGE_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone)]
struct Block {
    data: Vec<u8>,
    /// Owned exclusively by this context; has never been exported to a
    /// worker. Flipped to `false` on `export_state`.
    local: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Frame {
    input_index: Option<u16>,
    output_index: Option<u16>,
    error_index: Option<u16>,
}

/// The block table and call stack exported across a background-plugin
/// boundary. Local blocks are handed over by value; non-local blocks are
/// referenced by index only (see `import_state`'s `copy` flag).
#[derive(Debug, Clone)]
pub struct CallState {
    blocks: Vec<Option<ExportedBlock>>,
    stack: Vec<(Option<u16>, Option<u16>, Option<u16>)>,
}

#[derive(Debug, Clone)]
enum ExportedBlock {
    /// A block that was local to the sender; its bytes travel by value.
    Owned(Vec<u8>),
    /// A block the sender already considered foreign; referenced by index
    /// only, so the receiver must already know its contents.
    Referenced,
}

/// Owns the block table, call stack, and variable map for one plug-in
/// instance (or one side of a background-plugin's worker boundary).
pub struct CallContext {
    blocks: Vec<Option<Block>>,
    stack: Vec<Frame>,
    variables: HashMap<String, Vec<u8>>,
    config: HashMap<String, String>,
    max_pages: Option<u64>,
    max_var_bytes: Option<u64>,
    pub log_sink: LogSink,
    host_context: Option<Box<dyn std::any::Any + Send>>,
}

impl CallContext {
    pub fn new(
        config: HashMap<String, String>,
        max_pages: Option<u64>,
        max_var_bytes: Option<u64>,
        log_sink: LogSink,
    ) -> Self {
        CallContext {
            // Index 0 is the reserved null page: a one-byte block that is
            // never addressable (address_to_index(addr) == 0 always means
            // "no block", regardless of what actually sits in slot 0).
            blocks: vec![Some(Block {
                data: vec![0u8],
                local: false,
            })],
            stack: Vec::new(),
            variables: HashMap::new(),
            config,
            max_pages,
            max_var_bytes,
            log_sink,
            host_context: None,
        }
    }

    pub fn set_host_context<T: 'static + Send>(&mut self, value: T) {
        self.host_context = Some(Box::new(value));
    }

    pub fn host_context<T: 'static>(&self) -> Option<&T> {
        self.host_context.as_ref().and_then(|b| b.downcast_ref())
    }

    pub fn clear_host_context(&mut self) {
        self.host_context = None;
    }

    fn total_pages(&self) -> u64 {
        let total_bytes: u64 = self
            .blocks
            .iter()
            .skip(1)
            .filter_map(|b| b.as_ref())
            .map(|b| b.data.len() as u64)
            .sum();
        total_bytes.div_ceil(PAGE_SIZE)
    }

    fn push_block(&mut self, data: Vec<u8>) -> u64 {
        let index = self.blocks.len() as u16;
        self.blocks.push(Some(Block { data, local: true }));
        address::index_to_address(index, 0)
    }

    fn resolve(&self, address: u64) -> Option<&Block> {
        let index = address::address_to_index(address);
        if index == NULL_INDEX {
            return None;
        }
        self.blocks.get(index as usize).and_then(|b| b.as_ref())
    }

    fn resolve_mut(&mut self, address: u64) -> Option<&mut Block> {
        let index = address::address_to_index(address);
        if index == NULL_INDEX {
            return None;
        }
        self.blocks.get_mut(index as usize).and_then(|b| b.as_mut())
    }

    /// Appends a fresh local block of `size` zeroed bytes, enforcing
    /// `max_pages`. Returns address 0 on budget exceeded.
    pub fn alloc(&mut self, size: u64) -> u64 {
        if let Some(max_pages) = self.max_pages {
            let incoming_pages = size.div_ceil(PAGE_SIZE);
            if self.total_pages() + incoming_pages > max_pages {
                log::error!(
                    "alloc of {} bytes would exceed max_pages budget ({})",
                    size,
                    max_pages
                );
                return 0;
            }
        }
        self.push_block(vec![0u8; size as usize])
    }

    /// Returns a read-only view of the block at `address`, or `None` if
    /// the address names no block.
    pub fn read(&self, address: u64) -> Option<&[u8]> {
        self.resolve(address).map(|b| b.data.as_slice())
    }

    /// Appends `bytes` as a new local block. Empty input returns address 0
    /// ("none"), matching `store`'s documented edge policy.
    pub fn store(&mut self, bytes: &[u8]) -> u64 {
        if bytes.is_empty() {
            return 0;
        }
        if let Some(max_pages) = self.max_pages {
            let incoming_pages = (bytes.len() as u64).div_ceil(PAGE_SIZE);
            if self.total_pages() + incoming_pages > max_pages {
                log::error!("store of {} bytes would exceed max_pages budget", bytes.len());
                return 0;
            }
        }
        self.push_block(bytes.to_vec())
    }

    /// Reads the byte at `address`'s block-relative offset, or 0 if the
    /// address names no block or the offset runs past the block's length.
    pub fn load_u8(&self, address: u64) -> u8 {
        let offset = address::mask_address(address) as usize;
        self.resolve(address)
            .and_then(|b| b.data.get(offset).copied())
            .unwrap_or(0)
    }

    /// Reads 8 little-endian bytes starting at `address`'s block-relative
    /// offset, or 0 if they don't all lie within the block.
    pub fn load_u64(&self, address: u64) -> u64 {
        let offset = address::mask_address(address) as usize;
        self.resolve(address)
            .and_then(|b| b.data.get(offset..offset + 8))
            .map(|s| u64::from_le_bytes(s.try_into().unwrap()))
            .unwrap_or(0)
    }

    /// Writes `value` at `address`'s block-relative offset, extending the
    /// block with zeros if the offset runs past its current length. Fails
    /// if `address` names no block, per the kernel ABI's edge policy:
    /// "writes to a missing block fail with an error describing the
    /// address."
    pub fn store_u8(&mut self, address: u64, value: u8) -> Result<()> {
        let offset = address::mask_address(address) as usize;
        match self.resolve_mut(address) {
            Some(block) => {
                if block.data.len() <= offset {
                    block.data.resize(offset + 1, 0);
                }
                block.data[offset] = value;
                Ok(())
            }
            None => Err(Error::config(format!("store_u8 targeted missing block at address {address:#x}"))),
        }
    }

    pub fn store_u64(&mut self, address: u64, value: u64) -> Result<()> {
        let offset = address::mask_address(address) as usize;
        match self.resolve_mut(address) {
            Some(block) => {
                let end = offset + 8;
                if block.data.len() < end {
                    block.data.resize(end, 0);
                }
                block.data[offset..end].copy_from_slice(&value.to_le_bytes());
                Ok(())
            }
            None => Err(Error::config(format!("store_u64 targeted missing block at address {address:#x}"))),
        }
    }

    /// Number of slots in the block table, including freed ones and the
    /// reserved null page. A background plugin's host-call servicer uses
    /// this to diff which indices a host function allocated during one
    /// call, since `store`/`alloc` always append.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Directly installs `data` as a local block at `index`, growing the
    /// table with empty slots if needed. Used to hand a block received over
    /// the background-plugin ring transport to the side that didn't create
    /// it, without disturbing the call stack the way `import_state` does.
    pub fn install_block(&mut self, index: u16, data: Vec<u8>) {
        let idx = index as usize;
        if idx >= self.blocks.len() {
            self.blocks.resize_with(idx + 1, || None);
        }
        self.blocks[idx] = Some(Block { data, local: true });
    }

    /// Populates local blocks from a received `CallState`'s owned entries,
    /// leaving the call stack untouched. Used by a background plugin's
    /// host-call servicer to see the same blocks the worker's guest call
    /// can see, without adopting the worker's in-flight frame.
    pub fn adopt_exported_blocks(&mut self, state: &CallState) {
        for (index, exported) in state.blocks.iter().enumerate() {
            if let Some(ExportedBlock::Owned(data)) = exported {
                self.install_block(index as u16, data.clone());
            }
        }
    }

    pub fn length(&self, address: u64) -> u64 {
        self.resolve(address).map(|b| b.data.len() as u64).unwrap_or(0)
    }

    /// Clears the table slot; a no-op on address 0 or an already-free slot.
    pub fn free(&mut self, address: u64) {
        let index = address::address_to_index(address);
        if index == NULL_INDEX {
            return;
        }
        if let Some(slot) = self.blocks.get_mut(index as usize) {
            *slot = None;
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<&[u8]> {
        self.variables.get(name).map(|v| v.as_slice())
    }

    /// `set_variable(name, &[])` is a deletion, matching `var_set(key, 0)`
    /// at the ABI layer.
    pub fn set_variable(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            self.variables.remove(name);
            return Ok(());
        }
        if let Some(max) = self.max_var_bytes {
            let existing = self.variables.get(name).map(|v| v.len()).unwrap_or(0) as u64;
            let current_total: u64 = self.variables.values().map(|v| v.len() as u64).sum();
            let projected = current_total - existing + bytes.len() as u64;
            if projected > max {
                return Err(Error::resource_limit(format!(
                    "set_variable({name:?}) would use {projected} bytes, exceeding max_var_bytes ({max})"
                )));
            }
        }
        self.variables.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    pub fn delete_variable(&mut self, name: &str) {
        self.variables.remove(name);
    }

    pub fn get_config(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(|s| s.as_str())
    }

    /// Allocates a block holding `message`'s UTF-8 bytes and installs it as
    /// the current frame's error slot.
    pub fn set_error(&mut self, message: &str) -> Result<()> {
        let addr = self.store(message.as_bytes());
        self.error_set(addr)
    }

    pub fn is_active(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Pushes a new frame. Re-entrancy (calling `begin` while a frame is
    /// already active) is the caller's responsibility to reject before
    /// reaching here — `CallContext` itself just maintains the LIFO stack.
    pub fn begin(&mut self, input_index: Option<u16>) {
        self.stack.push(Frame {
            input_index,
            output_index: None,
            error_index: None,
        });
    }

    /// Pops the current frame, returning `(error_index, output_index)` —
    /// the caller inspects the error slot first, falling back to output.
    pub fn end(&mut self) -> (Option<u16>, Option<u16>) {
        match self.stack.pop() {
            Some(frame) => (frame.error_index, frame.output_index),
            None => (None, None),
        }
    }

    fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.stack.last_mut()
    }

    fn current_frame(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn input_address(&self) -> u64 {
        match self.current_frame().and_then(|f| f.input_index) {
            Some(index) => address::index_to_address(index, 0),
            None => 0,
        }
    }

    pub fn input_length(&self) -> u64 {
        self.length(self.input_address())
    }

    /// Records `(address, length)` as the current frame's output. Fails if
    /// `length` exceeds the block's actual byte length or if there is no
    /// active frame.
    pub fn output_set(&mut self, address: u64, length: u64) -> Result<()> {
        let block_len = self.length(address);
        if length > block_len {
            return Err(Error::config(format!(
                "output_set length {length} exceeds block length {block_len}"
            )));
        }
        let index = address::address_to_index(address);
        match self.current_frame_mut() {
            Some(frame) => {
                frame.output_index = if index == NULL_INDEX { None } else { Some(index) };
                Ok(())
            }
            None => Err(Error::config("output_set called with no active call frame")),
        }
    }

    /// Installs `address` as the current frame's error slot. Fails if the
    /// address names no block, or if there is no active frame.
    pub fn error_set(&mut self, address: u64) -> Result<()> {
        if address != 0 && self.resolve(address).is_none() {
            return Err(Error::config(format!(
                "error_set targets missing block at address {address:#x}"
            )));
        }
        let index = address::address_to_index(address);
        match self.current_frame_mut() {
            Some(frame) => {
                frame.error_index = if index == NULL_INDEX { None } else { Some(index) };
                Ok(())
            }
            None => Err(Error::config("error_set called with no active call frame")),
        }
    }

    pub fn error_get(&self) -> u64 {
        match self.current_frame().and_then(|f| f.error_index) {
            Some(index) => address::index_to_address(index, 0),
            None => 0,
        }
    }

    /// Refuses while a call is in flight; otherwise empties the block table
    /// (keeping the null page at index 0), clears the stack, and — per the
    /// Open Question resolution in SPEC_FULL.md §4.3 — clears variables too.
    pub fn reset(&mut self) -> bool {
        if self.is_active() {
            return false;
        }
        self.blocks.truncate(1);
        self.variables.clear();
        true
    }

    /// Snapshots the block table and call stack for a hand-off across the
    /// background-plugin boundary. Local blocks move by value and are
    /// flipped to non-local in `self`, so a later `free` on the sender side
    /// cannot double-free bytes the worker now considers its own.
    pub fn export_state(&mut self) -> CallState {
        let blocks = self
            .blocks
            .iter_mut()
            .map(|slot| {
                slot.as_mut().map(|block| {
                    if block.local {
                        block.local = false;
                        ExportedBlock::Owned(block.data.clone())
                    } else {
                        ExportedBlock::Referenced
                    }
                })
            })
            .collect();
        let stack = self
            .stack
            .iter()
            .map(|f| (f.input_index, f.output_index, f.error_index))
            .collect();
        CallState { blocks, stack }
    }

    /// Installs `state` received from the other side of a background-plugin
    /// boundary. When `copy` is true, every block in `state` becomes a
    /// fresh local block (the receiver now owns it and may free it exactly
    /// once); when false, referenced-only blocks are skipped and must
    /// already be present at the same index in `self`.
    pub fn import_state(&mut self, state: CallState, copy: bool) {
        for (index, exported) in state.blocks.into_iter().enumerate() {
            match exported {
                Some(ExportedBlock::Owned(data)) => {
                    let block = Block { data, local: copy };
                    if index < self.blocks.len() {
                        self.blocks[index] = Some(block);
                    } else {
                        while self.blocks.len() < index {
                            self.blocks.push(None);
                        }
                        self.blocks.push(Some(block));
                    }
                }
                Some(ExportedBlock::Referenced) | None => {
                    // Referenced blocks are already visible at this index on
                    // the receiving side; nothing to copy.
                }
            }
        }
        self.stack = state
            .stack
            .into_iter()
            .map(|(input_index, output_index, error_index)| Frame {
                input_index,
                output_index,
                error_index,
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogSink;

    fn ctx() -> CallContext {
        CallContext::new(HashMap::new(), None, None, LogSink::default())
    }

    #[test]
    fn store_then_read_round_trips_bytes() {
        let mut c = ctx();
        let addr = c.store(b"hello world");
        assert_eq!(c.read(addr), Some(&b"hello world"[..]));
        assert_eq!(c.length(addr), 11);
    }

    #[test]
    fn empty_store_returns_none_address() {
        let mut c = ctx();
        assert_eq!(c.store(&[]), 0);
    }

    #[test]
    fn alloc_respects_max_pages_budget() {
        let mut c = CallContext::new(HashMap::new(), Some(1), None, LogSink::default());
        let ok = c.alloc(PAGE_SIZE);
        assert_ne!(ok, 0);
        let blocks_before = c.blocks.len();
        let rejected = c.alloc(1);
        assert_eq!(rejected, 0);
        assert_eq!(c.blocks.len(), blocks_before);
    }

    #[test]
    fn set_variable_respects_max_var_bytes() {
        let mut c = CallContext::new(HashMap::new(), None, Some(8), LogSink::default());
        c.set_variable("a", b"1234").unwrap();
        let err = c.set_variable("b", b"12345").unwrap_err();
        assert!(matches!(err, Error::ResourceLimitExceeded(_)));
        // previous value for "a" is retained
        assert_eq!(c.get_variable("a"), Some(&b"1234"[..]));
        assert_eq!(c.get_variable("b"), None);
        // growing the existing key back to the same budget still works
        c.set_variable("a", b"12345678").unwrap();
        assert_eq!(c.get_variable("a"), Some(&b"12345678"[..]));
    }

    #[test]
    fn var_set_empty_deletes() {
        let mut c = ctx();
        c.set_variable("k", b"v").unwrap();
        c.set_variable("k", b"").unwrap();
        assert_eq!(c.get_variable("k"), None);
    }

    #[test]
    fn reset_after_call_clears_blocks_but_not_index_zero() {
        let mut c = ctx();
        c.begin(None);
        let (_err, _out) = c.end();
        c.store(b"leftover");
        assert!(c.reset());
        assert_eq!(c.blocks.len(), 1);
    }

    #[test]
    fn reset_refuses_while_active() {
        let mut c = ctx();
        c.begin(None);
        assert!(!c.reset());
        c.end();
        assert!(c.reset());
    }

    #[test]
    fn output_set_rejects_length_beyond_block() {
        let mut c = ctx();
        c.begin(None);
        let addr = c.store(b"abc");
        let err = c.output_set(addr, 10).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn error_set_rejects_missing_block() {
        let mut c = ctx();
        c.begin(None);
        let err = c.error_set(address::index_to_address(200, 0)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn store_u8_rejects_missing_block() {
        let mut c = ctx();
        let err = c.store_u8(address::index_to_address(200, 0), 1).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn store_u64_rejects_missing_block() {
        let mut c = ctx();
        let err = c.store_u64(address::index_to_address(200, 0), 1).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn store_u8_and_store_u64_succeed_against_a_live_block() {
        let mut c = ctx();
        let addr = c.store(b"\0\0\0\0\0\0\0\0\0\0");
        c.store_u8(addr, 7).unwrap();
        c.store_u64(address::index_to_address(address::address_to_index(addr), 1), 0x0102030405060708).unwrap();
        assert_eq!(c.read(addr), Some(&[7, 8, 7, 6, 5, 4, 3, 2, 1, 0][..]));
    }

    #[test]
    fn end_prefers_error_over_output_for_the_caller_to_inspect() {
        let mut c = ctx();
        c.begin(None);
        let out_addr = c.store(b"output");
        let err_addr = c.store(b"error");
        c.output_set(out_addr, 6).unwrap();
        c.error_set(err_addr).unwrap();
        let (err, out) = c.end();
        assert!(err.is_some());
        assert!(out.is_some());
    }

    #[test]
    fn export_then_import_round_trips_local_blocks_and_flips_ownership() {
        let mut sender = ctx();
        let addr = sender.store(b"payload");
        let index = address::address_to_index(addr);
        let state = sender.export_state();
        // sender's block is no longer local, so a second export carries a
        // `Referenced` marker instead of the bytes again.
        let second = sender.export_state();
        match &second.blocks[index as usize] {
            Some(ExportedBlock::Referenced) => {}
            other => panic!("expected referenced marker, got {other:?}"),
        }

        let mut receiver = ctx();
        receiver.import_state(state, true);
        assert_eq!(receiver.read(addr), Some(&b"payload"[..]));
    }
}

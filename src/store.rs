//! The `wasmtime::Store` data type threaded through every guest call.
//!
//! Bundles the pieces that wasmtime-facing code (the ABI functions in
//! [`crate::abi`], the linker in [`crate::linker`]) needs access to from a
//! `Caller`: the block memory manager, the HTTP adapter's mutable state,
//! and (when WASI is enabled) the `wasi-common` context. This mirrors the
//! teacher's `ModuleRegistry`, which bundled a `WasiCtx` with the waPC
//! `ModuleState` for exactly the same reason — wasmtime requires a single
//! `Store<T>` data type per instance.

use wasmtime_wasi::WasiCtx;

use crate::call_context::CallContext;
use crate::http::HttpState;

pub struct StoreData {
    pub call_context: CallContext,
    pub http: HttpState,
    pub wasi: Option<WasiCtx>,
}

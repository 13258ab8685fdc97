//! Per-instantiation plug-in configuration (SPEC_FULL.md §4.1/§6) and the
//! read-only capability probe a host can use to decide what a particular
//! build of this crate supports before it commits to a manifest shape.

use std::collections::HashMap;
use std::sync::Arc;

use wasmtime::{Val, ValType};

use crate::call_context::CallContext;
use crate::error::Result;
use crate::http::Fetch;
use crate::logging::{DefaultLogger, LogLevel, Logger};

/// A host function an embedder registers under an import namespace, with
/// an explicit signature — mirroring the teacher's `FuncType::new(...)`
/// registrations rather than inferring types from the guest's own import
/// declaration, which carries no information about what the host intends
/// to do with the call.
#[derive(Clone)]
pub struct HostFunctionDef {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    pub func: Arc<dyn Fn(&mut CallContext, &[Val]) -> Result<Vec<Val>> + Send + Sync>,
}

impl HostFunctionDef {
    pub fn new(
        params: Vec<ValType>,
        results: Vec<ValType>,
        func: impl Fn(&mut CallContext, &[Val]) -> Result<Vec<Val>> + Send + Sync + 'static,
    ) -> Self {
        HostFunctionDef {
            params,
            results,
            func: Arc::new(func),
        }
    }
}

/// Default size of the ring buffer a background plugin's worker thread
/// shares with its host half (SPEC_FULL.md §4.3).
pub const DEFAULT_SHARED_ARRAY_BUFFER_SIZE: u64 = 64 * 1024;

/// Configuration that applies to one plug-in instance, separate from the
/// manifest (which describes the Wasm bytes and their static limits).
#[derive(Clone)]
pub struct PluginOptions {
    pub use_wasi: bool,
    pub run_in_worker: bool,
    /// Host functions, keyed by import namespace then by function name.
    pub functions: HashMap<String, HashMap<String, HostFunctionDef>>,
    pub logger: Arc<dyn Logger>,
    pub log_level: LogLevel,
    pub fetch: Arc<dyn Fetch>,
    pub shared_array_buffer_size: u64,
    pub allow_http_response_headers: bool,
    /// Mirrors Extism's `EXTISM_ENABLE_WASI_OUTPUT` escape hatch: by
    /// default a WASI guest's stdout/stderr are discarded, since plug-ins
    /// are not supposed to have an ambient console.
    pub enable_wasi_output: bool,
}

impl Default for PluginOptions {
    fn default() -> Self {
        PluginOptions {
            use_wasi: false,
            run_in_worker: false,
            functions: HashMap::new(),
            logger: Arc::new(DefaultLogger),
            log_level: LogLevel::default(),
            fetch: Arc::new(crate::http::UreqFetch),
            shared_array_buffer_size: DEFAULT_SHARED_ARRAY_BUFFER_SIZE,
            allow_http_response_headers: false,
            enable_wasi_output: wasi_output_env_enabled(),
        }
    }
}

fn wasi_output_env_enabled() -> bool {
    std::env::var("EXTISM_ENABLE_WASI_OUTPUT")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// A read-only snapshot of what this build of the crate can do, so a host
/// can branch on capability instead of probing by triggering an error.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub shared_buffer_transport: bool,
    pub path_based_manifest_items: bool,
    pub cross_origin_enforcement: bool,
    pub filesystem_access: bool,
    pub worker_capable: bool,
    pub wasi_capable: bool,
    pub timeout_capable: bool,
    pub wasi_output_enabled: bool,
}

impl Capabilities {
    pub fn current() -> Self {
        Capabilities {
            shared_buffer_transport: true,
            // Resolving a manifest item's wasm bytes from a filesystem path
            // is the external loader's job (SPEC_FULL.md §1); this crate
            // only ever receives already-resolved bytes.
            path_based_manifest_items: false,
            cross_origin_enforcement: true,
            filesystem_access: false,
            worker_capable: true,
            wasi_capable: true,
            timeout_capable: true,
            wasi_output_enabled: wasi_output_env_enabled(),
        }
    }
}

//! The foreground plug-in (SPEC_FULL.md §4.2): manifest + options in,
//! a callable instance out.
//!
//! A `Plugin` owns one `wasmtime::Store` and every linked module named in
//! its manifest. `call` is synchronous and single-flight — a second call
//! while one is in flight fails immediately with [`Error::Reentrancy`],
//! matching the teacher's single-threaded execution assumption (waPC's own
//! doc comment: "assumes a single-threaded execution environment").

use wasmtime::{Engine, Store, Val};
use wasmtime_wasi::{WasiCtx, WasiCtxBuilder};

use crate::address;
use crate::call_context::CallContext;
use crate::error::{Error, Result};
use crate::http::{HttpConfig, HttpState};
use crate::linker::{self, LinkedModule};
use crate::logging::LogSink;
use crate::manifest::{self, Manifest};
use crate::options::PluginOptions;
use crate::store::StoreData;

/// A function to call: either a bare name, resolved against the manifest's
/// `main` module, or an explicit `(module, name)` pair.
pub enum FunctionRef {
    Bare(String),
    Qualified(String, String),
}

impl From<&str> for FunctionRef {
    fn from(name: &str) -> Self {
        FunctionRef::Bare(name.to_string())
    }
}

impl From<String> for FunctionRef {
    fn from(name: String) -> Self {
        FunctionRef::Bare(name)
    }
}

impl From<(&str, &str)> for FunctionRef {
    fn from((module, name): (&str, &str)) -> Self {
        FunctionRef::Qualified(module.to_string(), name.to_string())
    }
}

pub struct Plugin {
    store: Store<StoreData>,
    modules: Vec<LinkedModule>,
}

impl Plugin {
    /// Compiles and links every Wasm item in `manifest`, applying `options`.
    /// A configuration or linking failure here is fatal to creation — no
    /// plug-in is returned, matching spec.md §7.
    pub fn create(manifest: &Manifest, options: PluginOptions) -> Result<Self> {
        let engine = Engine::default();
        let (names, wasm_modules) = manifest::prepare_modules(&manifest.wasm, &engine)?;

        let log_sink = LogSink::new(options.logger.clone(), options.log_level);
        let call_context = CallContext::new(
            manifest.config.clone(),
            manifest.memory.max_pages,
            manifest.memory.max_var_bytes,
            log_sink,
        );

        let http_config = HttpConfig::new(
            &manifest.allowed_hosts,
            manifest.memory.max_http_response_bytes,
            options.allow_http_response_headers,
            options.fetch.clone(),
        )?;
        let http = HttpState::new(http_config);

        let wasi = if options.use_wasi {
            Some(build_wasi_ctx(options.enable_wasi_output)?)
        } else {
            None
        };

        let mut store = Store::new(&engine, StoreData { call_context, http, wasi });
        let modules = linker::link_and_instantiate(&mut store, &names, &wasm_modules, &options.functions)?;

        Ok(Plugin { store, modules })
    }

    /// `true` iff a call is currently in flight (the call stack is
    /// non-empty), i.e. a second `call` right now would fail with
    /// [`Error::Reentrancy`].
    pub fn is_active(&self) -> bool {
        self.store.data().call_context.is_active()
    }

    /// Empties the block table (except index 0) and clears variables.
    /// Refuses, returning `false`, while a call is in flight.
    pub fn reset(&mut self) -> bool {
        self.store.data_mut().call_context.reset()
    }

    /// `true` iff `func` names an exported function on the relevant module.
    pub fn function_exists(&mut self, func: impl Into<FunctionRef>) -> bool {
        self.resolve_function(&func.into()).is_ok()
    }

    /// Associates an arbitrary host-supplied value with the in-flight call,
    /// retrievable by host functions via `CallContext::host_context`.
    pub fn set_host_context<T: 'static + Send>(&mut self, value: T) {
        self.store.data_mut().call_context.set_host_context(value);
    }

    /// Invokes `func` with `input`, returning the guest's output bytes.
    ///
    /// The exported guest function takes no parameters and returns a single
    /// `i32`: zero means failure (the current frame's error slot is read
    /// for a message), nonzero means success (the output slot is read).
    /// This mirrors the handle-indirected calling convention the kernel ABI
    /// is built around — the guest retrieves its input through
    /// `input_offset`/`input_length` rather than through Wasm call
    /// arguments.
    pub fn call(&mut self, func: impl Into<FunctionRef>, input: &[u8]) -> Result<Vec<u8>> {
        if self.is_active() {
            return Err(Error::Reentrancy);
        }

        let func_ref = func.into();
        let handle = self.resolve_function(&func_ref)?;

        let input_index = if input.is_empty() {
            None
        } else {
            let addr = self.store.data_mut().call_context.store(input);
            Some(address::address_to_index(addr))
        };
        self.store.data_mut().call_context.begin(input_index);

        let mut results = [Val::I32(0)];
        let call_result = handle.call(&mut self.store, &[], &mut results);
        let (error_index, output_index) = self.store.data_mut().call_context.end();

        call_result.map_err(|e| Error::PluginTrap(e.to_string()))?;

        let success = matches!(results[0], Val::I32(n) if n != 0);
        if !success {
            let message = error_index
                .map(|idx| address::index_to_address(idx, 0))
                .and_then(|addr| self.store.data().call_context.read(addr))
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_else(|| "guest call failed with no error message set".to_string());
            return Err(Error::PluginOriginated(message));
        }

        Ok(output_index
            .map(|idx| address::index_to_address(idx, 0))
            .and_then(|addr| self.store.data().call_context.read(addr))
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default())
    }

    fn resolve_function(&mut self, func_ref: &FunctionRef) -> Result<wasmtime::Func> {
        match func_ref {
            FunctionRef::Bare(name) => {
                let main = self
                    .modules
                    .iter()
                    .find(|m| m.name == "main")
                    .expect("manifest preparation guarantees exactly one module named \"main\"");
                main.instance
                    .get_export(&mut self.store, name)
                    .and_then(|e| e.into_func())
                    .ok_or_else(|| Error::FunctionNotFound(name.clone()))
            }
            FunctionRef::Qualified(module, name) => {
                let target = self
                    .modules
                    .iter()
                    .find(|m| &m.name == module)
                    .ok_or_else(|| Error::PluginNotFound(module.clone()))?;
                target
                    .instance
                    .get_export(&mut self.store, name)
                    .and_then(|e| e.into_func())
                    .ok_or_else(|| Error::FunctionNotFound(format!("{module}::{name}")))
            }
        }
    }
}

/// By default a WASI guest's stdout/stderr are discarded rather than
/// inherited, since a plug-in is not supposed to have an ambient console —
/// `enable_wasi_output` (or the `EXTISM_ENABLE_WASI_OUTPUT` environment
/// variable, via [`PluginOptions::default`]) opts back into inheriting
/// them, useful for debugging a guest under test.
fn build_wasi_ctx(enable_output: bool) -> Result<WasiCtx> {
    let mut builder = WasiCtxBuilder::new();
    if enable_output {
        builder = builder.inherit_stdout().inherit_stderr();
    }
    Ok(builder.build())
}

//! # extism-core
//!
//! A host runtime for executing sandboxed, Extism-style WebAssembly
//! plug-ins. The guest never touches host memory directly: every byte that
//! crosses the boundary goes through a handle-indirected block memory
//! manager ([`call_context::CallContext`]), addressed by a synthetic 64-bit
//! pointer whose high 16 bits select a block and whose low 48 bits are a
//! byte offset within it (see [`address`]).
//!
//! A plug-in is built from a [`manifest::Manifest`] (one or more Wasm
//! modules, exactly one of which is named `main`) plus
//! [`options::PluginOptions`] (host functions, WASI, logging, HTTP). Two
//! execution topologies are available:
//!
//! - [`plugin::Plugin`] runs its guest synchronously on the caller's own
//!   thread.
//! - [`background::BackgroundPlugin`] runs its guest on a dedicated worker
//!   thread, servicing any host functions the guest invokes over a
//!   shared-buffer ring transport so a slow host function doesn't have to
//!   block the worker's caller.
//!
//! # Example
//! ```no_run
//! use extism_core::{Manifest, ManifestItem, Plugin, PluginOptions};
//!
//! # fn load_module() -> Vec<u8> { vec![] }
//! # fn main() -> extism_core::Result<()> {
//! let manifest = Manifest::new(vec![ManifestItem::from_bytes(load_module())]);
//! let mut plugin = Plugin::create(&manifest, PluginOptions::default())?;
//! let output = plugin.call("count_vowels", b"hello world")?;
//! println!("{}", String::from_utf8_lossy(&output));
//! # Ok(())
//! # }
//! ```
//!
//! # Notes
//! A plug-in is not reentrant: only one `call` may be in flight on a given
//! handle at a time, whether that call came from the embedding host or (in
//! background mode) from a host function's own attempt to call back in.
//! Guest-originated failures (a trap, or the guest explicitly setting an
//! error block) fail only the call in progress — the plug-in remains usable
//! for the next one.

#[macro_use]
extern crate log;

pub mod abi;
pub mod address;
pub mod background;
pub mod call_context;
pub mod error;
pub mod http;
pub mod linker;
pub mod logging;
pub mod manifest;
pub mod options;
pub mod plugin;
mod store;

/// A result type for errors that occur within this crate.
pub use error::Result;
pub use error::Error;

pub use background::BackgroundPlugin;
pub use call_context::{CallContext, CallState};
pub use http::{Fetch, HttpRequestData, HttpResponseData};
pub use linker::GuestRuntime;
pub use logging::{LogLevel, Logger};
pub use manifest::{Manifest, ManifestItem, MemoryOptions, WasmSource};
pub use options::{Capabilities, HostFunctionDef, PluginOptions};
pub use plugin::{FunctionRef, Plugin};

/// A runnable plug-in, dispatching to either execution topology depending on
/// [`PluginOptions::run_in_worker`]. Most callers can use this instead of
/// picking between [`Plugin`] and [`BackgroundPlugin`] directly.
pub enum AnyPlugin {
    Foreground(Plugin),
    Background(BackgroundPlugin),
}

impl AnyPlugin {
    /// Creates a foreground or background plug-in depending on
    /// `options.run_in_worker`.
    pub fn create(manifest: &Manifest, options: PluginOptions) -> Result<Self> {
        if options.run_in_worker {
            Ok(AnyPlugin::Background(BackgroundPlugin::create(manifest.clone(), options)?))
        } else {
            Ok(AnyPlugin::Foreground(Plugin::create(manifest, options)?))
        }
    }

    pub fn call(&mut self, func: impl Into<FunctionRef>, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            AnyPlugin::Foreground(p) => p.call(func, input),
            AnyPlugin::Background(p) => p.call(func, input),
        }
    }

    /// Refuses while a call is in flight. Foreground always reports its
    /// outcome synchronously; background reports the same, over the
    /// worker-channel round trip.
    pub fn reset(&mut self) -> Result<bool> {
        match self {
            AnyPlugin::Foreground(p) => Ok(p.reset()),
            AnyPlugin::Background(p) => p.reset(),
        }
    }

    pub fn function_exists(&mut self, func: impl Into<FunctionRef>) -> Result<bool> {
        match self {
            AnyPlugin::Foreground(p) => Ok(p.function_exists(func)),
            AnyPlugin::Background(p) => p.function_exists(func),
        }
    }

    /// Idempotent. A foreground plug-in has nothing to tear down beyond
    /// ordinary `Drop`; a background plug-in stops its worker and servicer
    /// threads.
    pub fn close(&mut self) {
        if let AnyPlugin::Background(p) = self {
            p.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_module() -> Vec<u8> {
        wat::parse_str(
            r#"
            (module
                (func (export "noop") (result i32) (i32.const 1))
            )
            "#,
        )
        .unwrap()
    }

    #[test]
    fn any_plugin_defaults_to_foreground() {
        let manifest = Manifest::new(vec![ManifestItem::from_bytes(echo_module())]);
        let mut plugin = AnyPlugin::create(&manifest, PluginOptions::default()).unwrap();
        assert!(matches!(plugin, AnyPlugin::Foreground(_)));
        assert!(plugin.function_exists("noop").unwrap());
        plugin.close();
    }

    #[test]
    fn any_plugin_run_in_worker_picks_background() {
        let manifest = Manifest::new(vec![ManifestItem::from_bytes(echo_module())]);
        let options = PluginOptions {
            run_in_worker: true,
            ..PluginOptions::default()
        };
        let mut plugin = AnyPlugin::create(&manifest, options).unwrap();
        assert!(matches!(plugin, AnyPlugin::Background(_)));
        assert!(plugin.function_exists("noop").unwrap());
        plugin.close();
    }
}

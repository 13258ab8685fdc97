//! The worker thread a [`super::BackgroundPlugin`] runs its guest Wasm on.
//!
//! The worker owns an ordinary [`Plugin`], just like the foreground path,
//! except every host function it was given gets rewired first: instead of
//! running the embedder's closure directly, the rewired version exports the
//! in-flight call's block-table state, ships a [`HostCallRequest`] to the
//! parent-side servicer, and blocks on the ring buffer for the reply.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};

use wasmtime::Val;

use crate::call_context::{CallContext, CallState};
use crate::error::Result;
use crate::options::{HostFunctionDef, PluginOptions};
use crate::plugin::{FunctionRef, Plugin};

use super::ring::{self, Ring};

/// An owned, `'static` stand-in for [`FunctionRef`] so it can cross an mpsc
/// channel (`FunctionRef` itself borrows nothing, but doesn't implement
/// `Send`-friendly conversions on its own — this makes the intent explicit
/// at the worker boundary).
#[derive(Debug, Clone)]
pub enum OwnedFunctionRef {
    Bare(String),
    Qualified(String, String),
}

impl From<OwnedFunctionRef> for FunctionRef {
    fn from(r: OwnedFunctionRef) -> Self {
        match r {
            OwnedFunctionRef::Bare(n) => FunctionRef::Bare(n),
            OwnedFunctionRef::Qualified(m, n) => FunctionRef::Qualified(m, n),
        }
    }
}

pub enum Invoke {
    Call { func: OwnedFunctionRef, input: Vec<u8> },
    Reset,
    FunctionExists(OwnedFunctionRef),
}

pub enum InvokeResult {
    Call(Result<Vec<u8>>),
    Reset(bool),
    FunctionExists(bool),
}

/// A nested host-function call, exported from the worker's in-flight guest
/// call for the parent-side servicer to run.
pub struct HostCallRequest {
    pub namespace: String,
    pub name: String,
    pub args: Vec<Val>,
    pub state: CallState,
}

/// Replaces every registered host function's closure with one that proxies
/// the call across the worker boundary instead of running it in-process.
fn rewire_functions(
    functions: &HashMap<String, HashMap<String, HostFunctionDef>>,
    host_call_tx: Sender<HostCallRequest>,
    ring: std::sync::Arc<Ring>,
    timeout: std::time::Duration,
) -> HashMap<String, HashMap<String, HostFunctionDef>> {
    let mut rewired = HashMap::with_capacity(functions.len());
    for (namespace, by_name) in functions {
        let mut inner = HashMap::with_capacity(by_name.len());
        for (name, def) in by_name {
            let namespace = namespace.clone();
            let name = name.clone();
            let host_call_tx = host_call_tx.clone();
            let ring = ring.clone();
            let result_types = def.results.clone();
            let rewired_def = HostFunctionDef::new(def.params.clone(), def.results.clone(), move |ctx: &mut CallContext, args: &[Val]| {
                let state = ctx.export_state();
                host_call_tx
                    .send(HostCallRequest {
                        namespace: namespace.clone(),
                        name: name.clone(),
                        args: args.to_vec(),
                        state,
                    })
                    .map_err(|_| crate::error::Error::transport("host-call servicer is gone"))?;
                let reply = ring::recv_reply(&ring, timeout)?;
                for (index, data) in reply.blocks {
                    ctx.install_block(index as u16, data);
                }
                match reply.ret {
                    ring::ReturnValue::Err(message) => Err(crate::error::Error::PluginOriginated(message)),
                    ret => Ok(ring::return_to_vals(ret, &result_types)),
                }
            });
            inner.insert(name, rewired_def);
        }
        rewired.insert(namespace.clone(), inner);
    }
    rewired
}

/// Builds the worker's `Plugin` (with rewired host functions) and then
/// services `requests` until the channel is dropped. Reports whether
/// creation succeeded via `ready` before entering the service loop, so a
/// `Plugin::create` failure surfaces synchronously to whoever is waiting on
/// `BackgroundPlugin::create`/`restart_worker`.
pub fn run(
    manifest: crate::manifest::Manifest,
    mut options: PluginOptions,
    host_call_tx: Sender<HostCallRequest>,
    ring: std::sync::Arc<Ring>,
    call_timeout: std::time::Duration,
    ready: Sender<Result<()>>,
    requests: Receiver<Invoke>,
    responses: Sender<InvokeResult>,
) {
    options.functions = rewire_functions(&options.functions, host_call_tx, ring, call_timeout);

    let mut plugin = match Plugin::create(&manifest, options) {
        Ok(p) => {
            let _ = ready.send(Ok(()));
            p
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Ok(invoke) = requests.recv() {
        let result = match invoke {
            Invoke::Call { func, input } => InvokeResult::Call(plugin.call(func, &input)),
            Invoke::Reset => InvokeResult::Reset(plugin.reset()),
            Invoke::FunctionExists(func) => InvokeResult::FunctionExists(plugin.function_exists(func)),
        };
        if responses.send(result).is_err() {
            // The parent hung up (most likely `close()` racing this
            // iteration's reply); nothing left for the worker to do.
            break;
        }
    }
}

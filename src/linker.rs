//! Multi-module instantiation and cross-module linking (SPEC_FULL.md §4.4).
//!
//! A manifest may declare more than one Wasm item, and those items may
//! import functions from each other by module name in addition to the
//! kernel ABI (`env`) and, if enabled, WASI. This generalizes the teacher's
//! `arrange_imports`/`callback_for_import` pattern — built for a single
//! fixed waPC ABI — to an arbitrary import graph, including graphs with
//! cycles, which are broken with a one-shot lazy trampoline filled in once
//! the cycle's target module finishes instantiating.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use wasmtime::{Engine, Extern, ExternType, Func, FuncType, Instance, Linker, Module, Store, Val};

use crate::abi;
use crate::error::{Error, Result};
use crate::options::HostFunctionDef;
use crate::store::StoreData;

/// The guest entrypoint convention detected from a linked module's exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestRuntime {
    /// No recognized entrypoint export; the module is called into directly.
    None,
    /// A WASI reactor, started via `_initialize`.
    Reactor,
    /// A WASI command, started via `_start`.
    Command,
    /// A GHC Haskell runtime, started via `hs_init`.
    Haskell,
}

impl GuestRuntime {
    fn detect(instance: &Instance, store: &mut Store<StoreData>) -> Self {
        if instance.get_export(&mut *store, "hs_init").is_some() {
            GuestRuntime::Haskell
        } else if instance.get_export(&mut *store, "_initialize").is_some() {
            GuestRuntime::Reactor
        } else if instance.get_export(&mut *store, "_start").is_some() {
            GuestRuntime::Command
        } else {
            GuestRuntime::None
        }
    }

    fn entrypoint_name(self) -> Option<&'static str> {
        match self {
            GuestRuntime::Haskell => Some("hs_init"),
            GuestRuntime::Reactor => Some("_initialize"),
            GuestRuntime::Command => Some("_start"),
            GuestRuntime::None => None,
        }
    }
}

pub struct LinkedModule {
    pub name: String,
    pub instance: Instance,
    pub runtime: GuestRuntime,
}

enum VisitState {
    InProgress,
    Done(Instance),
}

type Trampoline = Rc<RefCell<Option<Func>>>;

/// Instantiates every module named in `names`/`modules`, resolving kernel
/// ABI, WASI, host-registered, and cross-module imports (the last of which
/// may be circular). Runs each module's detected entrypoint exactly once,
/// immediately after that module finishes instantiating.
pub fn link_and_instantiate(
    store: &mut Store<StoreData>,
    names: &[String],
    modules: &[Module],
    functions: &HashMap<String, HashMap<String, HostFunctionDef>>,
) -> Result<Vec<LinkedModule>> {
    let engine = store.engine().clone();
    let by_name: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();

    let mut base_linker: Linker<StoreData> = Linker::new(&engine);
    abi::register(&mut base_linker).map_err(Error::Wasm)?;
    if store.data().wasi.is_some() {
        wasmtime_wasi::add_to_linker(&mut base_linker, |s: &mut StoreData| {
            s.wasi.as_mut().expect("wasi import encountered but no WasiCtx was installed")
        })
        .map_err(Error::Wasm)?;
    }
    register_host_functions(&mut base_linker, functions)?;

    let mut visited: HashMap<usize, VisitState> = HashMap::new();
    let mut pending: Vec<(usize, String, Trampoline)> = Vec::new();
    let mut instances: Vec<Option<Instance>> = vec![None; names.len()];

    for start in 0..names.len() {
        instantiate(
            store,
            names,
            modules,
            &by_name,
            &base_linker,
            start,
            &mut Vec::new(),
            &mut visited,
            &mut pending,
            &mut instances,
        )?;
    }

    for (target_idx, func_name, cell) in pending {
        let instance = instances[target_idx]
            .expect("every module reachable through a trampoline is instantiated by the loop above");
        let func = instance
            .get_export(&mut *store, &func_name)
            .and_then(|e| e.into_func())
            .ok_or_else(|| {
                Error::config(format!(
                    "circular import resolved against module \"{}\" but it does not export function \"{}\"",
                    names[target_idx], func_name
                ))
            })?;
        *cell.borrow_mut() = Some(func);
    }

    let mut linked = Vec::with_capacity(names.len());
    for (i, instance) in instances.into_iter().enumerate() {
        let instance = instance.expect("all indices are instantiated by the loop above");
        let runtime = GuestRuntime::detect(&instance, store);
        if let Some(entry) = runtime.entrypoint_name() {
            if let Some(func) = instance.get_export(&mut *store, entry).and_then(|e| e.into_func()) {
                func.call(&mut *store, &[], &mut []).map_err(Error::Wasm)?;
            }
        }
        linked.push(LinkedModule {
            name: names[i].clone(),
            instance,
            runtime,
        });
    }
    Ok(linked)
}

#[allow(clippy::too_many_arguments)]
fn instantiate(
    store: &mut Store<StoreData>,
    names: &[String],
    modules: &[Module],
    by_name: &HashMap<&str, usize>,
    base_linker: &Linker<StoreData>,
    idx: usize,
    path: &mut Vec<String>,
    visited: &mut HashMap<usize, VisitState>,
    pending: &mut Vec<(usize, String, Trampoline)>,
    instances: &mut Vec<Option<Instance>>,
) -> Result<Instance> {
    if let Some(state) = visited.get(&idx) {
        return match state {
            VisitState::Done(instance) => Ok(*instance),
            VisitState::InProgress => unreachable!("cycles are broken with a trampoline before recursing"),
        };
    }

    visited.insert(idx, VisitState::InProgress);
    path.push(names[idx].clone());

    let module = &modules[idx];
    let mut imports = Vec::with_capacity(module.imports().len());
    for imp in module.imports() {
        let item_name = imp.name();
        let import_module = imp.module();
        let ext = if let Some(ext) = base_linker.get(&mut *store, import_module, item_name) {
            ext
        } else if !by_name.contains_key(import_module) {
            return Err(unresolved_import_err(path, import_module, item_name));
        } else {
            let other_module = import_module;
            let target_idx = *by_name
                .get(other_module)
                .ok_or_else(|| unresolved_import_err(path, other_module, item_name))?;
            let cyclic = target_idx == idx || matches!(visited.get(&target_idx), Some(VisitState::InProgress));
            if cyclic {
                let func_ty = match imp.ty() {
                    ExternType::Func(ft) => ft,
                    _ => {
                        return Err(Error::config(format!(
                            "circular link between module \"{other_module}\" and {}: only function imports can be resolved lazily",
                            path_str(path)
                        )))
                    }
                };
                let cell: Trampoline = Rc::new(RefCell::new(None));
                pending.push((target_idx, item_name.to_string(), cell.clone()));
                Extern::Func(make_trampoline(store, func_ty, cell))
            } else {
                let target = instantiate(
                    store, names, modules, by_name, base_linker, target_idx, path, visited, pending, instances,
                )?;
                target
                    .get_export(&mut *store, item_name)
                    .ok_or_else(|| unresolved_import_err(path, other_module, item_name))?
            }
        };
        imports.push(ext);
    }

    let instance = Instance::new(&mut *store, module, &imports).map_err(Error::Wasm)?;
    path.pop();
    visited.insert(idx, VisitState::Done(instance));
    instances[idx] = Some(instance);
    Ok(instance)
}

fn make_trampoline(store: &mut Store<StoreData>, ty: FuncType, cell: Trampoline) -> Func {
    Func::new(&mut *store, ty, move |mut caller, params, results| {
        let target = cell
            .borrow()
            .clone()
            .expect("trampoline is filled in once its target module finishes instantiating");
        target.call(&mut caller, params, results)
    })
}

fn register_host_functions(
    linker: &mut Linker<StoreData>,
    functions: &HashMap<String, HashMap<String, HostFunctionDef>>,
) -> Result<()> {
    for (namespace, by_name) in functions {
        for (name, def) in by_name {
            let func = def.func.clone();
            let func_ty = FuncType::new(def.params.clone(), def.results.clone());
            linker
                .func_new(namespace, name, func_ty, move |mut caller, params, results| {
                    let out = (func)(&mut caller.data_mut().call_context, params)?;
                    results.clone_from_slice(&out);
                    Ok(())
                })
                .map_err(Error::Wasm)?;
        }
    }
    Ok(())
}

fn path_str(path: &[String]) -> String {
    path.iter().map(|n| format!("\"{n}\"")).collect::<Vec<_>>().join("/")
}

fn unresolved_import_err(path: &[String], import_module: &str, import_name: &str) -> Error {
    Error::config(format!(
        "from module {}: cannot resolve import \"{import_module}\" \"{import_name}\": not provided by host imports nor linked manifest items",
        path_str(path)
    ))
}

//! The guest-visible kernel ABI (SPEC_FULL.md §4.1's "Guest-visible host
//! functions" table), wired onto a `wasmtime::Linker<StoreData>` under the
//! [`KERNEL_NAMESPACE`].
//!
//! Each function here does the minimum required to move bytes/scalars
//! across the `Caller` boundary and then defers to [`CallContext`] (or
//! [`HttpState`]) for the actual memory-management or HTTP logic — the ABI
//! layer is deliberately thin, matching how the teacher's `callbacks.rs`
//! keeps wasm-linear-memory plumbing separate from `ModuleState`.

use wasmtime::{Caller, Linker};

use crate::logging::LogLevel;
use crate::store::StoreData;

/// The namespace the guest module imports kernel functions from, matching
/// the plain `"env"` convention used across the pack's wasm32 guest SDKs.
pub const KERNEL_NAMESPACE: &str = "env";

fn read_utf8(caller: &mut Caller<'_, StoreData>, address: u64) -> anyhow::Result<String> {
    let bytes = caller
        .data()
        .call_context
        .read(address)
        .map(|b| b.to_vec())
        .ok_or_else(|| anyhow::anyhow!("missing block at address {address:#x}"))?;
    String::from_utf8(bytes).map_err(|e| anyhow::anyhow!("block is not valid UTF-8: {e}"))
}

macro_rules! wrap {
    ($res:expr) => {
        $res.map_err(|e| anyhow::anyhow!(e.to_string()))
    };
}

/// Registers every guest-visible kernel ABI function onto `linker`.
pub fn register(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap(KERNEL_NAMESPACE, "alloc", |mut caller: Caller<'_, StoreData>, size: u64| {
        caller.data_mut().call_context.alloc(size)
    })?;

    linker.func_wrap(KERNEL_NAMESPACE, "free", |mut caller: Caller<'_, StoreData>, addr: u64| {
        caller.data_mut().call_context.free(addr);
    })?;

    linker.func_wrap(KERNEL_NAMESPACE, "length", |caller: Caller<'_, StoreData>, addr: u64| {
        caller.data().call_context.length(addr)
    })?;
    // `length_unsafe` skips nothing `length` doesn't already skip (there is
    // no unchecked fast path to take here — `CallContext::length` never
    // panics on a missing block), but guest modules built against the
    // kernel ABI table in spec.md §4.1 expect both names to be linkable.
    linker.func_wrap(KERNEL_NAMESPACE, "length_unsafe", |caller: Caller<'_, StoreData>, addr: u64| {
        caller.data().call_context.length(addr)
    })?;

    linker.func_wrap(KERNEL_NAMESPACE, "load_u8", |caller: Caller<'_, StoreData>, addr: u64| -> u32 {
        caller.data().call_context.load_u8(addr) as u32
    })?;
    linker.func_wrap(KERNEL_NAMESPACE, "load_u64", |caller: Caller<'_, StoreData>, addr: u64| -> u64 {
        caller.data().call_context.load_u64(addr)
    })?;

    linker.func_wrap(
        KERNEL_NAMESPACE,
        "store_u8",
        |mut caller: Caller<'_, StoreData>, addr: u64, value: u32| -> anyhow::Result<()> {
            wrap!(caller.data_mut().call_context.store_u8(addr, value as u8))
        },
    )?;
    linker.func_wrap(
        KERNEL_NAMESPACE,
        "store_u64",
        |mut caller: Caller<'_, StoreData>, addr: u64, value: u64| -> anyhow::Result<()> {
            wrap!(caller.data_mut().call_context.store_u64(addr, value))
        },
    )?;

    linker.func_wrap(KERNEL_NAMESPACE, "input_offset", |caller: Caller<'_, StoreData>| {
        caller.data().call_context.input_address()
    })?;
    linker.func_wrap(KERNEL_NAMESPACE, "input_length", |caller: Caller<'_, StoreData>| {
        caller.data().call_context.input_length()
    })?;
    linker.func_wrap(
        KERNEL_NAMESPACE,
        "input_load_u8",
        |caller: Caller<'_, StoreData>, offset: u64| -> u32 {
            let addr = caller.data().call_context.input_address();
            caller.data().call_context.load_u8(addr.wrapping_add(offset)) as u32
        },
    )?;
    linker.func_wrap(
        KERNEL_NAMESPACE,
        "input_load_u64",
        |caller: Caller<'_, StoreData>, offset: u64| -> u64 {
            let addr = caller.data().call_context.input_address();
            caller.data().call_context.load_u64(addr.wrapping_add(offset))
        },
    )?;

    linker.func_wrap(
        KERNEL_NAMESPACE,
        "output_set",
        |mut caller: Caller<'_, StoreData>, addr: u64, len: u64| -> anyhow::Result<()> {
            wrap!(caller.data_mut().call_context.output_set(addr, len))
        },
    )?;
    linker.func_wrap(
        KERNEL_NAMESPACE,
        "error_set",
        |mut caller: Caller<'_, StoreData>, addr: u64| -> anyhow::Result<()> {
            wrap!(caller.data_mut().call_context.error_set(addr))
        },
    )?;
    linker.func_wrap(KERNEL_NAMESPACE, "error_get", |caller: Caller<'_, StoreData>| {
        caller.data().call_context.error_get()
    })?;

    linker.func_wrap(
        KERNEL_NAMESPACE,
        "config_get",
        |mut caller: Caller<'_, StoreData>, key_addr: u64| -> anyhow::Result<u64> {
            let key = read_utf8(&mut caller, key_addr)?;
            let value = caller
                .data()
                .call_context
                .get_config(&key)
                .map(|v| v.as_bytes().to_vec());
            Ok(match value {
                Some(bytes) => caller.data_mut().call_context.store(&bytes),
                None => 0,
            })
        },
    )?;

    linker.func_wrap(
        KERNEL_NAMESPACE,
        "var_get",
        |mut caller: Caller<'_, StoreData>, key_addr: u64| -> anyhow::Result<u64> {
            let key = read_utf8(&mut caller, key_addr)?;
            let value = caller
                .data()
                .call_context
                .get_variable(&key)
                .map(|v| v.to_vec());
            Ok(match value {
                Some(bytes) => caller.data_mut().call_context.store(&bytes),
                None => 0,
            })
        },
    )?;
    linker.func_wrap(
        KERNEL_NAMESPACE,
        "var_set",
        |mut caller: Caller<'_, StoreData>, key_addr: u64, value_addr: u64| -> anyhow::Result<()> {
            let key = read_utf8(&mut caller, key_addr)?;
            let bytes = caller
                .data()
                .call_context
                .read(value_addr)
                .map(|b| b.to_vec())
                .unwrap_or_default();
            wrap!(caller.data_mut().call_context.set_variable(&key, &bytes))
        },
    )?;

    linker.func_wrap(
        KERNEL_NAMESPACE,
        "http_request",
        |mut caller: Caller<'_, StoreData>, request_addr: u64| -> anyhow::Result<u64> {
            let StoreData {
                call_context, http, ..
            } = caller.data_mut();
            wrap!(http.request(call_context, request_addr))
        },
    )?;
    linker.func_wrap(KERNEL_NAMESPACE, "http_status_code", |caller: Caller<'_, StoreData>| {
        caller.data().http.status_code()
    })?;
    linker.func_wrap(
        KERNEL_NAMESPACE,
        "http_headers",
        |mut caller: Caller<'_, StoreData>| -> anyhow::Result<u64> {
            let StoreData {
                call_context, http, ..
            } = caller.data_mut();
            wrap!(http.headers(call_context))
        },
    )?;

    for (name, level) in [
        ("log_trace", LogLevel::Trace),
        ("log_debug", LogLevel::Debug),
        ("log_info", LogLevel::Info),
        ("log_warn", LogLevel::Warn),
        ("log_error", LogLevel::Error),
    ] {
        linker.func_wrap(
            KERNEL_NAMESPACE,
            name,
            move |mut caller: Caller<'_, StoreData>, addr: u64| {
                match read_utf8(&mut caller, addr) {
                    Ok(message) => caller.data().call_context.log_sink.emit(level, &message),
                    Err(_) => log::error!("log_{:?} called with an invalid or missing block", level),
                }
            },
        )?;
    }

    Ok(())
}

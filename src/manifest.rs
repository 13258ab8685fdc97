//! Manifest parsing and module preparation (SPEC_FULL.md §4.4).
//!
//! The core does not fetch Wasm bytes from a URL or filesystem path itself —
//! that's the external manifest loader's job (SPEC_FULL.md §1, out of
//! scope). What lands here is already-resolved bytes (or a pre-compiled
//! `wasmtime::Module` reference), a name, and an optional expected SHA-256
//! hash. `prepare_modules` verifies the hash, compiles the bytes, and
//! assigns the final `(names, modules)` pair that the linker consumes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use wasmtime::{Engine, Module};

use crate::error::{Error, Result};

/// Either raw Wasm bytes (already resolved by an external loader from a
/// URL/path/HTTP response) or a reference to a module compiled ahead of
/// time. Only the former can be hash-verified.
#[derive(Clone)]
pub enum WasmSource {
    Bytes(Vec<u8>),
    Compiled(Module),
}

#[derive(Clone)]
pub struct ManifestItem {
    pub source: WasmSource,
    pub name: Option<String>,
    /// Expected SHA-256 hash, as lower-case hex.
    pub hash: Option<String>,
}

impl ManifestItem {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ManifestItem {
            source: WasmSource::Bytes(bytes),
            name: None,
            hash: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryOptions {
    pub max_pages: Option<u64>,
    pub max_http_response_bytes: Option<u64>,
    pub max_var_bytes: Option<u64>,
}

#[derive(Clone)]
pub struct Manifest {
    pub wasm: Vec<ManifestItem>,
    pub config: HashMap<String, String>,
    pub allowed_paths: HashMap<String, String>,
    pub allowed_hosts: Vec<String>,
    pub memory: MemoryOptions,
    pub timeout_ms: Option<u64>,
}

impl Manifest {
    pub fn new(wasm: Vec<ManifestItem>) -> Self {
        Manifest {
            wasm,
            config: HashMap::new(),
            allowed_paths: HashMap::new(),
            allowed_hosts: Vec::new(),
            memory: MemoryOptions::default(),
            timeout_ms: None,
        }
    }
}

/// Compares two 32-byte digests without short-circuiting on the first
/// differing byte, per the design notes' constant-time requirement.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

struct PreparedItem {
    name: Option<String>,
    module: Module,
}

/// Given a manifest's Wasm items, verifies hashes, compiles bytes, assigns
/// names, and picks exactly one `main` module.
pub fn prepare_modules(items: &[ManifestItem], engine: &Engine) -> Result<(Vec<String>, Vec<Module>)> {
    if items.is_empty() {
        return Err(Error::config("manifest must declare at least one wasm item"));
    }

    let mut prepared = Vec::with_capacity(items.len());
    for item in items {
        prepared.push(prepare_one(item, engine)?);
    }

    let resolved_names = assign_main(prepared.iter().enumerate().map(|(i, p)| {
        p.name.clone().unwrap_or_else(|| i.to_string())
    }).collect())?;

    let modules = prepared.into_iter().map(|p| p.module).collect();
    Ok((resolved_names, modules))
}

fn prepare_one(item: &ManifestItem, engine: &Engine) -> Result<PreparedItem> {
    match (&item.source, &item.hash) {
        (WasmSource::Compiled(_), Some(_)) => Err(Error::config(
            "a hash was specified for a pre-compiled module reference, which has no bytes to hash",
        )),
        (WasmSource::Bytes(bytes), Some(expected_hex)) => {
            let actual_hex = sha256_hex(bytes);
            let expected = hex::decode(expected_hex)
                .map_err(|e| Error::config(format!("manifest hash {expected_hex:?} is not valid hex: {e}")))?;
            let actual = hex::decode(&actual_hex).expect("sha256_hex always produces valid hex");
            if !constant_time_eq(&expected, &actual) {
                return Err(Error::config(format!(
                    "hash mismatch: manifest declared {expected_hex}, computed {actual_hex}"
                )));
            }
            let module = Module::new(engine, bytes).map_err(Error::Wasm)?;
            // A matched hash may stand in as the default name (lower-case hex).
            let name = item.name.clone().or_else(|| Some(actual_hex));
            Ok(PreparedItem { name, module })
        }
        (WasmSource::Bytes(bytes), None) => {
            let module = Module::new(engine, bytes).map_err(Error::Wasm)?;
            Ok(PreparedItem {
                name: item.name.clone(),
                module,
            })
        }
        (WasmSource::Compiled(module), None) => Ok(PreparedItem {
            name: item.name.clone(),
            module: module.clone(),
        }),
    }
}

/// Applies the "exactly one `main`" rule:
/// - a single item is always named `main`, regardless of its declared name;
/// - with multiple items, whichever already resolves to `main` keeps that
///   name; if none do, the last item is renamed to `main`.
fn assign_main(mut names: Vec<String>) -> Result<Vec<String>> {
    if names.len() == 1 {
        names[0] = "main".to_string();
        return Ok(names);
    }

    let main_indices: Vec<usize> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| *n == "main")
        .map(|(i, _)| i)
        .collect();

    match main_indices.len() {
        0 => {
            let last = names.len() - 1;
            names[last] = "main".to_string();
        }
        1 => {}
        _ => {
            return Err(Error::config(
                "more than one manifest item resolved to the name \"main\"",
            ))
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::default()
    }

    const EMPTY_MODULE_WAT: &str = "(module)";

    #[test]
    fn single_item_becomes_main_even_when_named_otherwise() {
        let bytes = wat::parse_str(EMPTY_MODULE_WAT).unwrap();
        let items = vec![ManifestItem::from_bytes(bytes).named("not-main")];
        let (names, modules) = prepare_modules(&items, &engine()).unwrap();
        assert_eq!(names, vec!["main".to_string()]);
        assert_eq!(modules.len(), 1);
    }

    #[test]
    fn multiple_unnamed_items_default_last_to_main() {
        let bytes = wat::parse_str(EMPTY_MODULE_WAT).unwrap();
        let items = vec![
            ManifestItem::from_bytes(bytes.clone()),
            ManifestItem::from_bytes(bytes),
        ];
        let (names, _) = prepare_modules(&items, &engine()).unwrap();
        assert_eq!(names, vec!["0".to_string(), "main".to_string()]);
    }

    #[test]
    fn explicit_main_name_is_respected() {
        let bytes = wat::parse_str(EMPTY_MODULE_WAT).unwrap();
        let items = vec![
            ManifestItem::from_bytes(bytes.clone()).named("main"),
            ManifestItem::from_bytes(bytes).named("lib"),
        ];
        let (names, _) = prepare_modules(&items, &engine()).unwrap();
        assert_eq!(names, vec!["main".to_string(), "lib".to_string()]);
    }

    #[test]
    fn duplicate_main_names_are_a_config_error() {
        let bytes = wat::parse_str(EMPTY_MODULE_WAT).unwrap();
        let items = vec![
            ManifestItem::from_bytes(bytes.clone()).named("main"),
            ManifestItem::from_bytes(bytes).named("main"),
        ];
        let err = prepare_modules(&items, &engine()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn hash_mismatch_is_fatal_with_both_hashes_in_message() {
        let bytes = wat::parse_str(EMPTY_MODULE_WAT).unwrap();
        let wrong_hash = "7def5bb4d1b1f5a1a1f1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a565";
        let items = vec![ManifestItem::from_bytes(bytes).with_hash(wrong_hash)];
        let err = prepare_modules(&items, &engine()).unwrap_err();
        match err {
            Error::Config(msg) => {
                assert!(msg.contains(wrong_hash));
            }
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn matching_hash_may_become_default_name() {
        let bytes = wat::parse_str(EMPTY_MODULE_WAT).unwrap();
        let hash = sha256_hex(&bytes);
        let items = vec![ManifestItem::from_bytes(bytes).with_hash(hash.clone())];
        let (names, _) = prepare_modules(&items, &engine()).unwrap();
        // single-item rule still forces "main"
        assert_eq!(names, vec!["main".to_string()]);
    }

    #[test]
    fn hash_on_precompiled_module_is_a_config_error() {
        let bytes = wat::parse_str(EMPTY_MODULE_WAT).unwrap();
        let engine = engine();
        let module = Module::new(&engine, &bytes).unwrap();
        let items = vec![ManifestItem {
            source: WasmSource::Compiled(module),
            name: None,
            hash: Some("aabb".to_string()),
        }];
        let err = prepare_modules(&items, &engine).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn constant_time_eq_catches_single_byte_difference() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[17] = 1;
        assert!(!constant_time_eq(&a, &b));
        assert!(constant_time_eq(&a, &a));
    }
}

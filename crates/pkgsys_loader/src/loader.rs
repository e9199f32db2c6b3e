//! Wasmi-based module loader.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use pkgsys_manifest::{Artifact, ContentDigest};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use wasmi::{
    Config, Engine, Extern, Instance, Linker, Module, Store, StoreLimits, StoreLimitsBuilder,
};

use crate::error::LoadError;
use crate::symbol::{Callable, Symbol, Value, is_representable};

/// Default memory limit for unit instances (128 MB).
const DEFAULT_MEMORY_LIMIT_BYTES: usize = 128 * 1024 * 1024;

/// Default fuel limit for start-up and for each call (instructions).
/// Enough for any reasonable initializer, but stops infinite loops.
const DEFAULT_FUEL_LIMIT: u64 = 1_000_000_000;

/// Initializer run after instantiation when the module exports it.
const INITIALIZE_EXPORT: &str = "_initialize";

/// Resource limits for a unit's sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxLimits {
    /// Maximum linear memory per instance, in bytes.
    pub memory_bytes: usize,
    /// Fuel for start-up, and again for every call.
    pub fuel: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            fuel: DEFAULT_FUEL_LIMIT,
        }
    }
}

/// Host state for a unit's store. Holds nothing the unit can reach.
pub(crate) struct UnitState {
    limits: StoreLimits,
}

/// A loaded unit. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    unit_name: String,
    provider_name: String,
    version: String,
    digest: ContentDigest,
    symbols: BTreeMap<String, Symbol>,
    loaded_at: SystemTime,
    load_time: Duration,
}

impl ModuleHandle {
    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&Callable> {
        self.get(name).and_then(Symbol::as_function)
    }

    pub fn value(&self, name: &str) -> Option<Value> {
        self.get(name).and_then(Symbol::as_value)
    }

    /// Exposed symbol names, sorted.
    pub fn symbol_names(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    pub fn symbols(&self) -> &BTreeMap<String, Symbol> {
        &self.symbols
    }

    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }

    /// Time spent compiling, instantiating and initializing.
    pub fn load_time(&self) -> Duration {
        self.load_time
    }
}

/// Loads artifacts into isolated wasmi instances.
///
/// The engine is shared; every load gets its own store.
pub struct ModuleLoader {
    engine: Engine,
    limits: SandboxLimits,
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new(SandboxLimits::default())
    }
}

impl ModuleLoader {
    pub fn new(limits: SandboxLimits) -> Self {
        let mut config = Config::default();
        config.consume_fuel(true);
        let engine = Engine::new(&config);

        Self { engine, limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Instantiate the artifact's entry point and collect its declared exports.
    ///
    /// The artifact must already be verified.
    pub fn load(&self, artifact: &Artifact) -> Result<ModuleHandle, LoadError> {
        let started = Instant::now();
        let manifest = &artifact.manifest;
        let wasm = artifact
            .entry_bytes()
            .ok_or_else(|| LoadError::MissingEntryPoint(manifest.entry_point.clone()))?;

        info!(
            "Loading {}.{} v{} ({} bytes)",
            manifest.provider,
            manifest.name,
            manifest.version,
            wasm.len()
        );

        let module = Module::new(&self.engine, wasm)
            .map_err(|e| LoadError::Compile(e.to_string()))?;

        let mut store = Store::new(
            &self.engine,
            UnitState {
                limits: StoreLimitsBuilder::new()
                    .memory_size(self.limits.memory_bytes)
                    .build(),
            },
        );
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.limits.fuel)
            .map_err(|e| LoadError::internal(format!("Failed to set fuel: {e}")))?;

        // No host functions: a unit cannot import anything.
        let linker = <Linker<UnitState>>::new(&self.engine);
        let instance = linker
            .instantiate_and_start(&mut store, &module)
            .map_err(|e| LoadError::Instantiate(e.to_string()))?;

        if let Ok(initialize) = instance.get_typed_func::<(), ()>(&store, INITIALIZE_EXPORT) {
            debug!("Running {INITIALIZE_EXPORT}");
            initialize
                .call(&mut store, ())
                .map_err(|e| LoadError::Trap(e.to_string()))?;
        }

        let symbols = self.collect_symbols(&instance, store, &manifest.exports)?;
        let load_time = started.elapsed();

        debug!(
            "Loaded {}.{} with {} symbols in {:?}",
            manifest.provider,
            manifest.name,
            symbols.len(),
            load_time
        );

        Ok(ModuleHandle {
            unit_name: manifest.name.clone(),
            provider_name: manifest.provider.clone(),
            version: manifest.version.clone(),
            digest: artifact.digest,
            symbols,
            loaded_at: SystemTime::now(),
            load_time,
        })
    }

    fn collect_symbols(
        &self,
        instance: &Instance,
        store: Store<UnitState>,
        exports: &[String],
    ) -> Result<BTreeMap<String, Symbol>, LoadError> {
        let mut symbols = BTreeMap::new();
        let mut functions = Vec::new();

        for name in exports {
            match instance.get_export(&store, name) {
                Some(Extern::Func(func)) => {
                    let ty = func.ty(&store);
                    if !ty.params().iter().chain(ty.results()).all(is_representable) {
                        return Err(LoadError::mismatch(
                            name,
                            "has parameter or result types other than i32/i64",
                        ));
                    }
                    functions.push((name.clone(), func, ty));
                }
                Some(Extern::Global(global)) => {
                    let value = Value::from_val(&global.get(&store))
                        .ok_or_else(|| LoadError::mismatch(name, "is not an i32/i64 global"))?;
                    symbols.insert(name.clone(), Symbol::Value(value));
                }
                Some(_) => {
                    return Err(LoadError::mismatch(name, "is not a function or global"));
                }
                None => {
                    return Err(LoadError::mismatch(name, "is not exported by the entry point"));
                }
            }
        }

        let store = Arc::new(Mutex::new(store));
        for (name, func, ty) in functions {
            let callable = Callable::new(
                name.clone(),
                func,
                Arc::from(ty.params()),
                Arc::from(ty.results()),
                Arc::clone(&store),
                self.limits.fuel,
            );
            symbols.insert(name, Symbol::Function(callable));
        }

        Ok(symbols)
    }
}

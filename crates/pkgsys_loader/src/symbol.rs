//! Typed symbols exposed by a loaded unit.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use wasmi::{Func, Store, Val, ValType};

use crate::error::CallError;
use crate::loader::UnitState;

/// A plain value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    I32(i32),
    I64(i64),
}

impl Value {
    fn type_name(ty: &ValType) -> &'static str {
        match ty {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            _ => "unsupported",
        }
    }

    pub(crate) fn from_val(val: &Val) -> Option<Self> {
        match val {
            Val::I32(v) => Some(Self::I32(*v)),
            Val::I64(v) => Some(Self::I64(*v)),
            _ => None,
        }
    }

    fn into_val(self) -> Val {
        match self {
            Self::I32(v) => Val::I32(v),
            Self::I64(v) => Val::I64(v),
        }
    }

    fn matches(&self, ty: &ValType) -> bool {
        matches!(
            (self, ty),
            (Self::I32(_), ValType::I32) | (Self::I64(_), ValType::I64)
        )
    }
}

/// Whether a wasm value type can be represented as a [`Value`].
pub(crate) fn is_representable(ty: &ValType) -> bool {
    matches!(ty, ValType::I32 | ValType::I64)
}

fn zero(ty: &ValType) -> Val {
    match ty {
        ValType::I64 => Val::I64(0),
        _ => Val::I32(0),
    }
}

/// An exported function of a loaded unit.
///
/// All callables of one module share its sandbox. Every call gets a fresh
/// fuel budget.
#[derive(Clone)]
pub struct Callable {
    name: String,
    func: Func,
    params: Arc<[ValType]>,
    results: Arc<[ValType]>,
    store: Arc<Mutex<Store<UnitState>>>,
    fuel: u64,
}

impl Callable {
    pub(crate) fn new(
        name: String,
        func: Func,
        params: Arc<[ValType]>,
        results: Arc<[ValType]>,
        store: Arc<Mutex<Store<UnitState>>>,
        fuel: u64,
    ) -> Self {
        Self {
            name,
            func,
            params,
            results,
            store,
            fuel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, CallError> {
        if args.len() != self.params.len() {
            return Err(CallError::Arity {
                name: self.name.clone(),
                expected: self.params.len(),
                actual: args.len(),
            });
        }
        if let Some((index, ty)) = args
            .iter()
            .zip(self.params.iter())
            .enumerate()
            .find_map(|(i, (arg, ty))| (!arg.matches(ty)).then_some((i, ty)))
        {
            return Err(CallError::ArgumentType {
                name: self.name.clone(),
                index,
                expected: Value::type_name(ty),
            });
        }

        let inputs: Vec<Val> = args.iter().map(|a| a.into_val()).collect();
        let mut outputs: Vec<Val> = self.results.iter().map(zero).collect();

        let mut store = self.store.lock();
        store.set_fuel(self.fuel).map_err(|e| self.trap(e))?;
        self.func
            .call(&mut *store, &inputs, &mut outputs)
            .map_err(|e| self.trap(e))?;

        Ok(outputs.iter().filter_map(Value::from_val).collect())
    }

    fn trap(&self, error: impl fmt::Display) -> CallError {
        CallError::Trap {
            name: self.name.clone(),
            message: error.to_string(),
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

/// A declared export, resolved at load time.
#[derive(Debug, Clone)]
pub enum Symbol {
    Value(Value),
    Function(Callable),
}

impl Symbol {
    pub fn as_value(&self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Function(_) => None,
        }
    }

    pub fn as_function(&self) -> Option<&Callable> {
        match self {
            Self::Function(f) => Some(f),
            Self::Value(_) => None,
        }
    }
}

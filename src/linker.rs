//! The dynamic linking environment: a table of named, late-bound cells.
//!
//! Compiled code never embeds a global's value. It refers to a global by
//! name, and the bootstrap method of the `invokedynamic` instruction asks
//! this table for a [`CallSite`], which caches the resolution until the cell
//! is redefined.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, LazyLock,
    },
};

use lasso::{Spur, ThreadedRodeo};
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::{
    runtime::{Convention, Signature},
    value::{Function, Symbol, Value},
};

pub mod prelude;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("{0} is not defined")]
    Unbound(Symbol),
    #[error("{name} is a {type_name}, not a function")]
    NotCallable {
        name: Symbol,
        type_name: &'static str,
    },
    #[error("{0} is a macro and cannot be called at run time")]
    MacroCall(Symbol),
    #[error("{name} called with {found} arguments, accepts {signature}")]
    Arity {
        name: Symbol,
        signature: Signature,
        found: usize,
    },
}

/// The indirection cell behind one global name.
#[derive(Debug)]
pub struct Cell {
    name: Symbol,
    value: RwLock<Option<Value>>,
    // bumped under the write lock, so readers holding the read lock see a
    // value and generation that belong together
    generation: AtomicU64,
}

impl Cell {
    fn new(name: Symbol) -> Self {
        Self {
            name,
            value: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn get(&self) -> Option<Value> {
        self.value.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> (Option<Value>, u64) {
        let value = self.value.read();
        (value.clone(), self.generation())
    }

    fn replace(&self, value: Option<Value>) -> Option<Value> {
        let mut slot = self.value.write();
        let previous = std::mem::replace(&mut *slot, value);
        self.generation.fetch_add(1, Ordering::AcqRel);
        previous
    }
}

/// Checks that `value`, bound to `name`, can be called with `arity` arguments.
fn callable(name: &Symbol, value: Option<Value>, arity: usize) -> Result<Function, LinkError> {
    match value {
        None => Err(LinkError::Unbound(name.clone())),
        Some(Value::Macro(_)) => Err(LinkError::MacroCall(name.clone())),
        Some(Value::Function(f)) if f.convention() == Convention::Macro => {
            Err(LinkError::MacroCall(name.clone()))
        }
        Some(Value::Function(f)) if !f.signature().accepts(arity) => Err(LinkError::Arity {
            name: name.clone(),
            signature: f.signature().clone(),
            found: arity,
        }),
        Some(Value::Function(f)) => Ok(f),
        Some(other) => Err(LinkError::NotCallable {
            name: name.clone(),
            type_name: other.type_name(),
        }),
    }
}

/// Coerces the value in operator position of a call that is not linked by
/// name; `head` is the operator's printed form. The callee checks the
/// argument count itself.
pub fn as_fn(head: &str, value: Value) -> Result<Function, LinkError> {
    match value {
        Value::Function(f) if f.convention() != Convention::Macro => Ok(f),
        Value::Function(_) | Value::Macro(_) => Err(LinkError::MacroCall(Symbol::new(head))),
        other => Err(LinkError::NotCallable {
            name: Symbol::new(head),
            type_name: other.type_name(),
        }),
    }
}

/// A linked call of a global with a fixed number of arguments.
///
/// Holds on to the cell, not to its value: redefining the global is seen on
/// the next [`CallSite::target`]. Failed resolutions are not cached, so a
/// site that failed once succeeds as soon as the global becomes callable.
#[derive(Debug)]
pub struct CallSite {
    cell: Arc<Cell>,
    arity: usize,
    cached: Mutex<Option<(u64, Function)>>,
}

impl CallSite {
    pub fn name(&self) -> &Symbol {
        self.cell.name()
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn target(&self) -> Result<Function, LinkError> {
        let mut cached = self.cached.lock();
        if let Some((seen, function)) = &*cached {
            if *seen == self.cell.generation() {
                return Ok(function.clone());
            }
        }
        let (value, generation) = self.cell.snapshot();
        let function = callable(self.cell.name(), value, self.arity)?;
        *cached = Some((generation, function.clone()));
        Ok(function)
    }
}

#[derive(Debug, Default)]
pub struct Linker {
    names: ThreadedRodeo,
    cells: RwLock<HashMap<Spur, Arc<Cell>>>,
}

static GLOBAL: LazyLock<Linker> = LazyLock::new(Linker::with_prelude);

impl Linker {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding the prelude macros.
    pub fn with_prelude() -> Self {
        let linker = Self::new();
        prelude::install(&linker);
        linker
    }

    /// The process-wide table, created with the prelude on first use.
    pub fn global() -> &'static Linker {
        &GLOBAL
    }

    /// The cell for `name`, created empty if it does not exist yet.
    pub fn cell(&self, name: &str) -> Arc<Cell> {
        let key = self.names.get_or_intern(name);
        if let Some(cell) = self.cells.read().get(&key) {
            return cell.clone();
        }
        self.cells
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Cell::new(Symbol::new(name))))
            .clone()
    }

    fn existing(&self, name: &str) -> Option<Arc<Cell>> {
        let key = self.names.get(name)?;
        self.cells.read().get(&key).cloned()
    }

    /// Binds `name`, returning what it was bound to before.
    pub fn insert(&self, name: &str, value: Value) -> Option<Value> {
        debug!("linking {name} to a {}", value.type_name());
        self.cell(name).replace(Some(value))
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.existing(name)?.get()
    }

    /// Unbinds `name`. Call sites already linked to it fail from now on.
    pub fn remove(&self, name: &str) -> Option<Value> {
        let cell = self.existing(name)?;
        let previous = cell.replace(None);
        if previous.is_some() {
            debug!("unlinked {name}");
        }
        previous
    }

    pub fn resolve(&self, name: &str, arity: usize) -> Result<Function, LinkError> {
        match self.existing(name) {
            Some(cell) => callable(cell.name(), cell.get(), arity),
            None => Err(LinkError::Unbound(Symbol::new(name))),
        }
    }

    pub fn call_site(&self, name: &str, arity: usize) -> CallSite {
        CallSite {
            cell: self.cell(name),
            arity,
            cached: Mutex::new(None),
        }
    }
}

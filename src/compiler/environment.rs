use std::collections::HashMap;

use crate::value::Symbol;

/// Index of a scope in an [`Environment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

/// Index of a function literal being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub usize);

/// Where a symbol lives, seen from some scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A local slot of the method being compiled.
    Local(u16),
    /// Bound outside one or more function literals; these are the literals
    /// crossed, innermost first. Each must capture the symbol.
    Captured(Vec<ClassId>),
    /// Not lexically bound: a global, resolved by the linker.
    Global,
}

#[derive(Debug)]
struct Scope {
    parent: Option<ScopeId>,
    bindings: HashMap<Symbol, u16>,
    /// Set when this scope is the outermost scope of a function clause.
    boundary: Option<ClassId>,
    next_slot: u16,
}

/// Lexical scopes of one compilation unit, stored in an arena and addressed
/// by index. Scopes only ever point at their parent.
#[derive(Debug)]
pub struct Environment {
    scopes: Vec<Scope>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("too many local variables")]
pub struct SlotOverflow;

impl Environment {
    /// Creates the arena with its root scope, the body of a static method
    /// whose locals start at slot 0.
    pub fn new() -> (Self, ScopeId) {
        let root = Scope {
            parent: None,
            bindings: HashMap::new(),
            boundary: None,
            next_slot: 0,
        };
        (Self { scopes: vec![root] }, ScopeId(0))
    }

    fn add(&mut self, scope: Scope) -> ScopeId {
        self.scopes.push(scope);
        ScopeId(self.scopes.len() - 1)
    }

    /// A nested scope in the same method, allocating after its parent's slots.
    pub fn push(&mut self, parent: ScopeId) -> ScopeId {
        let next_slot = self.scopes[parent.0].next_slot;
        self.add(Scope {
            parent: Some(parent),
            bindings: HashMap::new(),
            boundary: None,
            next_slot,
        })
    }

    /// The scope of a function clause. Slot 0 is the function instance, so
    /// numbering restarts at 1.
    pub fn push_boundary(&mut self, parent: ScopeId, class: ClassId) -> ScopeId {
        self.add(Scope {
            parent: Some(parent),
            bindings: HashMap::new(),
            boundary: Some(class),
            next_slot: 1,
        })
    }

    /// Binds `name` to a fresh slot.
    pub fn bind(&mut self, scope: ScopeId, name: Symbol) -> Result<u16, SlotOverflow> {
        let scope = &mut self.scopes[scope.0];
        let slot = scope.next_slot;
        scope.next_slot = slot.checked_add(1).ok_or(SlotOverflow)?;
        scope.bindings.insert(name, slot);
        Ok(slot)
    }

    /// Binds `name` to an already allocated slot.
    pub fn bind_at(&mut self, scope: ScopeId, name: Symbol, slot: u16) {
        self.scopes[scope.0].bindings.insert(name, slot);
    }

    pub fn is_bound(&self, scope: ScopeId, name: &Symbol) -> bool {
        self.resolve(scope, name) != Resolution::Global
    }

    pub fn resolve(&self, scope: ScopeId, name: &Symbol) -> Resolution {
        let mut crossed = Vec::new();
        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = &self.scopes[id.0];
            if let Some(slot) = scope.bindings.get(name) {
                return if crossed.is_empty() {
                    Resolution::Local(*slot)
                } else {
                    Resolution::Captured(crossed)
                };
            }
            if let Some(class) = scope.boundary {
                crossed.push(class);
            }
            current = scope.parent;
        }
        Resolution::Global
    }
}

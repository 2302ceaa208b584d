//! Generation-tagged handles into the managed runtime.
//!
//! Every class, field, method, and object handle obtained from an
//! [`AppDomain`](crate::assembly::AppDomain) carries the [`Generation`] of the
//! domain that produced it. Domains refuse handles from any other generation
//! with [`ScriptError::StaleHandle`](crate::ScriptError::StaleHandle), so a
//! handle that survived a reload is detected instead of being dereferenced
//! against the wrong store.

use std::fmt;

use wasmtime::Func;

/// A load generation. Incremented every time a new application domain is
/// built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub(crate) u32);

impl Generation {
    /// The raw counter value.
    pub fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Identifies a class inside one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassHandle {
    pub(crate) generation: Generation,
    pub(crate) index: u32,
}

impl ClassHandle {
    pub fn generation(&self) -> Generation {
        self.generation
    }
}

/// Locates a field inside an object of its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldHandle {
    pub(crate) generation: Generation,
    pub(crate) offset: u32,
}

impl FieldHandle {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Byte offset of the field from the start of the object.
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// A callable managed method.
#[derive(Clone)]
pub struct MethodHandle {
    pub(crate) generation: Generation,
    pub(crate) func: Func,
    /// Qualified name, e.g. `Sandbox.Player::OnUpdate`.
    pub(crate) name: String,
    /// Arguments, excluding the object itself.
    pub(crate) param_count: usize,
}

impl MethodHandle {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }
}

impl fmt::Debug for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHandle")
            .field("generation", &self.generation)
            .field("name", &self.name)
            .field("param_count", &self.param_count)
            .finish_non_exhaustive()
    }
}

/// A live managed object (its address in the domain's linear memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    pub(crate) generation: Generation,
    pub(crate) address: u32,
}

impl ObjectHandle {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn address(&self) -> u32 {
        self.address
    }
}

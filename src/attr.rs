//! Attribute cells: how units publish outputs and read each other's.
//!
//! An [`Attr`] is an output owned by exactly one unit. Other units see it
//! through an [`AttrRef`], which is read-only: binding a demanded input
//! ([`Slot`]) to another unit's output creates a data link. The graph wires
//! slots through type-erased [`AttrHandle`]s that units publish by name.

use std::any::Any;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{FlowError, FlowResult};

/// An owned, writable attribute.
#[derive(Debug, Default)]
pub struct Attr<T> {
    cell: Arc<RwLock<T>>,
}

impl<T> Attr<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(RwLock::new(value)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.write()
    }

    pub fn set(&self, value: T) {
        *self.cell.write() = value;
    }

    /// A read-only alias to this attribute.
    pub fn share(&self) -> AttrRef<T> {
        AttrRef {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Clone> Attr<T> {
    pub fn get(&self) -> T {
        self.cell.read().clone()
    }
}

impl<T: Send + Sync + 'static> Attr<T> {
    /// Publishes this attribute under `name`.
    pub fn handle(&self, name: &'static str) -> AttrHandle {
        AttrHandle {
            name,
            type_name: std::any::type_name::<T>(),
            value: Arc::new(self.share()),
        }
    }
}

/// Read-only alias of another unit's [`Attr`].
#[derive(Debug)]
pub struct AttrRef<T> {
    cell: Arc<RwLock<T>>,
}

impl<T> Clone for AttrRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> AttrRef<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.read()
    }

    /// Whether both refer to the same underlying cell.
    pub fn ptr_eq(&self, other: &AttrRef<T>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub fn aliases(&self, attr: &Attr<T>) -> bool {
        Arc::ptr_eq(&self.cell, &attr.cell)
    }
}

impl<T: Clone> AttrRef<T> {
    pub fn get(&self) -> T {
        self.cell.read().clone()
    }
}

/// A named, type-erased output attribute.
#[derive(Clone)]
pub struct AttrHandle {
    pub name: &'static str,
    pub type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl AttrHandle {
    /// Recovers the typed alias, or `None` if `T` is not the attribute's type.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<AttrRef<T>> {
        self.value.downcast_ref::<AttrRef<T>>().cloned()
    }
}

impl std::fmt::Debug for AttrHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AttrHandle({}: {})", self.name, self.type_name)
    }
}

/// A demanded input attribute. Unbound until [`Slot::bind`] is called.
#[derive(Debug)]
pub struct Slot<T> {
    name: &'static str,
    bound: Option<AttrRef<T>>,
}

impl<T> Slot<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, bound: None }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bind(&mut self, source: AttrRef<T>) {
        self.bound = Some(source);
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// The bound source, or a configuration error naming `unit`.
    pub fn get(&self, unit: &str) -> FlowResult<&AttrRef<T>> {
        self.bound.as_ref().ok_or_else(|| FlowError::Configuration {
            unit: unit.to_string(),
            attr: self.name.to_string(),
        })
    }

    pub fn source(&self) -> Option<&AttrRef<T>> {
        self.bound.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_reference_sees_writes() {
        let owner = Attr::new(1u32);
        let alias = owner.share();
        owner.set(5);
        assert_eq!(alias.get(), 5);
        assert!(alias.aliases(&owner));
    }

    #[test]
    fn handle_downcasts_only_to_its_type() {
        let owner = Attr::new(vec![1.0f32]);
        let handle = owner.handle("values");
        assert!(handle.downcast::<Vec<f32>>().is_some());
        assert!(handle.downcast::<u32>().is_none());
    }

    #[test]
    fn unbound_slot_is_a_configuration_error() {
        let mut slot: Slot<u32> = Slot::new("labels");
        let err = slot.get("evaluator").unwrap_err();
        assert!(err.is_configuration());

        let owner = Attr::new(3u32);
        slot.bind(owner.share());
        assert_eq!(slot.get("evaluator").unwrap().get(), 3);
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::net::sequence_greater_than;
use crate::wire::{WireError, WireReader, WireValue, WireWriter};

use super::{EntityId, VariableIndex};

pub(crate) type ChangedMap = BTreeMap<EntityId, BTreeSet<VariableIndex>>;

/// Handle a variable uses to tell its manager it changed.
#[derive(Debug, Clone, Default)]
pub struct ChangeNotifier {
    changed: Arc<Mutex<ChangedMap>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_variable_changed(&self, entity: EntityId, index: VariableIndex) {
        self.changed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity)
            .or_default()
            .insert(index);
    }

    pub(crate) fn take(&self) -> ChangedMap {
        std::mem::take(&mut *self.changed.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn forget(&self, entity: EntityId) {
        self.changed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entity);
    }

    pub fn is_empty(&self) -> bool {
        self.changed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Where a variable lives: the owning entity, its slot, and the manager to
/// notify. Client-side variables carry no notifier.
#[derive(Debug, Clone)]
pub struct Binding {
    pub entity: EntityId,
    pub index: VariableIndex,
    pub notifier: Option<ChangeNotifier>,
}

/// Type-erased view a manager drives a variable through.
pub trait ReplicatedVariable {
    fn name(&self) -> &str;

    fn is_dirty(&self) -> bool;

    fn clear_dirty(&mut self);

    fn write_value(&self, writer: &mut WireWriter) -> bool;

    /// Decodes one value and applies it if `sequence` is newer than the
    /// last one applied. The value is always consumed from `reader`.
    fn apply_update(&mut self, reader: &mut WireReader<'_>, sequence: u16)
    -> Result<bool, WireError>;

    /// Drops the last applied sequence once it is more than `max_age`
    /// behind `newest`, so the next update applies unconditionally.
    fn expire_sequence(&mut self, newest: u16, max_age: u16);

    fn bind(&mut self, name: &str, binding: Binding);

    fn binding(&self) -> Option<&Binding>;
}

#[derive(Debug, Clone)]
pub struct Variable<T> {
    name: String,
    value: T,
    dirty: bool,
    last_sequence: Option<u16>,
    binding: Option<Binding>,
}

impl<T: WireValue + Clone + PartialEq> Variable<T> {
    pub fn new(value: T) -> Self {
        Self {
            name: String::new(),
            value,
            dirty: false,
            last_sequence: None,
            binding: None,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Writing the current value again is not a change. Only variables
    /// owned by a server manager become dirty; elsewhere a write is local.
    pub fn set(&mut self, value: T) {
        if self.value == value {
            return;
        }
        self.value = value;
        if let Some(Binding {
            entity,
            index,
            notifier: Some(notifier),
        }) = &self.binding
        {
            self.dirty = true;
            notifier.notify_variable_changed(*entity, *index);
        }
    }

    pub fn update<F: FnOnce(&mut T)>(&mut self, f: F) {
        let mut value = self.value.clone();
        f(&mut value);
        self.set(value);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_sequence(&self) -> Option<u16> {
        self.last_sequence
    }
}

impl<T: WireValue + Clone + PartialEq + Default> Default for Variable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::ops::Deref for Variable<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: WireValue + Clone + PartialEq> ReplicatedVariable for Variable<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn write_value(&self, writer: &mut WireWriter) -> bool {
        writer.write(&self.value)
    }

    fn apply_update(
        &mut self,
        reader: &mut WireReader<'_>,
        sequence: u16,
    ) -> Result<bool, WireError> {
        let value = reader.try_read::<T>()?;
        let newer = self
            .last_sequence
            .is_none_or(|last| sequence_greater_than(sequence, last));
        if !newer {
            return Ok(false);
        }
        self.value = value;
        self.last_sequence = Some(sequence);
        Ok(true)
    }

    fn expire_sequence(&mut self, newest: u16, max_age: u16) {
        let expired = self
            .last_sequence
            .is_some_and(|last| newest.wrapping_sub(last) > max_age);
        if expired {
            self.last_sequence = None;
        }
    }

    fn bind(&mut self, name: &str, binding: Binding) {
        self.name = name.to_owned();
        self.binding = Some(binding);
    }

    fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }
}

use std::any::Any;

use super::variable::ReplicatedVariable;

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A replicated object. Variables are listed in declaration order; the
/// position in that list is the variable's index.
pub trait Entity: AsAny + Send {
    fn variables(&self) -> Vec<&dyn ReplicatedVariable>;

    fn variables_mut(&mut self) -> Vec<&mut dyn ReplicatedVariable>;
}

/// Registration metadata for a concrete entity type.
pub trait EntityType: Entity + Sized + 'static {
    /// Factory key, sent on the wire with every create.
    const TYPE_NAME: &'static str;

    /// Declared variable names, in the order `variables()` returns them.
    const VARIABLES: &'static [&'static str];

    fn create() -> Self;
}

use crate::{
    types::{FieldDescription, FieldId},
    value::{ObjectRef, Value},
};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Values of static fields, shared by every thread. A field that was never
/// written reads as the zero value of its type.
#[derive(Debug, Default)]
pub struct StaticStorage {
    values: RwLock<HashMap<FieldId, Value>>,
}

impl StaticStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &FieldDescription) -> Value {
        self.values
            .read()
            .get(&field.id)
            .copied()
            .unwrap_or_else(|| Value::default_for(field.field_type))
    }

    pub fn set(&self, field: &FieldDescription, value: Value) {
        self.values
            .write()
            .insert(field.id, value.narrow_to(field.field_type));
    }

    /// Non-null references currently stored in static fields.
    pub fn references(&self) -> Vec<ObjectRef> {
        self.values
            .read()
            .values()
            .filter_map(|v| match v {
                Value::Ref(r) if !r.is_null() => Some(*r),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resolve::{ClassBuilder, ClassRegistry, Resolver},
        types::AccessFlags,
        value::HEAP_BASE,
    };

    #[test]
    fn test_defaults_and_narrowing() {
        let registry = ClassRegistry::new();
        let mut holder = ClassBuilder::new("Holder");
        holder
            .field("flag", "Z", AccessFlags::STATIC)
            .field("total", "J", AccessFlags::STATIC)
            .field("last", "Ljava/lang/Object;", AccessFlags::STATIC);
        let holder = registry.define(holder).unwrap();
        let fields: Vec<_> = registry
            .class(holder)
            .static_fields
            .iter()
            .map(|f| registry.field(*f))
            .collect();

        let statics = StaticStorage::new();
        assert_eq!(statics.get(&fields[0]), Value::Int(0));
        assert_eq!(statics.get(&fields[1]), Value::Long(0));
        assert_eq!(statics.get(&fields[2]), Value::NULL);

        statics.set(&fields[0], Value::Int(3));
        assert_eq!(statics.get(&fields[0]), Value::Int(1));

        let obj = ObjectRef::from_address(HEAP_BASE + 8);
        statics.set(&fields[2], Value::Ref(obj));
        assert_eq!(statics.references(), vec![obj]);
    }
}

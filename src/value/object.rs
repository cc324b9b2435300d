use crate::{
    resolve::Resolver,
    types::{ArrayElement, BasicType, ClassDescription, ClassId},
    value::{ObjectRef, Value, HEAP_BASE, OBJECT_ALIGNMENT_SHIFT},
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Address span reserved for the heap. It stays within reach of the default
/// compressed encoding.
pub const HEAP_RESERVED: u64 = 16 << 30;

/// Elements of one array, stored unboxed by element type.
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayStorage {
    Boolean(Vec<i8>),
    Byte(Vec<i8>),
    Char(Vec<u16>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Reference(Vec<ObjectRef>),
}

macro_rules! for_each_array {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            ArrayStorage::Boolean($v) => $body,
            ArrayStorage::Byte($v) => $body,
            ArrayStorage::Char($v) => $body,
            ArrayStorage::Short($v) => $body,
            ArrayStorage::Int($v) => $body,
            ArrayStorage::Long($v) => $body,
            ArrayStorage::Float($v) => $body,
            ArrayStorage::Double($v) => $body,
            ArrayStorage::Reference($v) => $body,
        }
    };
}

impl ArrayStorage {
    pub fn new(element: ArrayElement, length: usize) -> Self {
        match element {
            ArrayElement::Reference(_) => ArrayStorage::Reference(vec![ObjectRef::NULL; length]),
            ArrayElement::Primitive(t) => match t {
                BasicType::Boolean => ArrayStorage::Boolean(vec![0; length]),
                BasicType::Byte => ArrayStorage::Byte(vec![0; length]),
                BasicType::Char => ArrayStorage::Char(vec![0; length]),
                BasicType::Short => ArrayStorage::Short(vec![0; length]),
                BasicType::Int => ArrayStorage::Int(vec![0; length]),
                BasicType::Long => ArrayStorage::Long(vec![0; length]),
                BasicType::Float => ArrayStorage::Float(vec![0.0; length]),
                BasicType::Double => ArrayStorage::Double(vec![0.0; length]),
                BasicType::Reference | BasicType::Void => {
                    unreachable!("{t:?} is not a primitive element type")
                }
            },
        }
    }

    pub fn len(&self) -> usize {
        for_each_array!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn load(&self, index: usize) -> Option<Value> {
        Some(match self {
            ArrayStorage::Boolean(v) | ArrayStorage::Byte(v) => Value::Int(*v.get(index)? as i32),
            ArrayStorage::Char(v) => Value::Int(*v.get(index)? as i32),
            ArrayStorage::Short(v) => Value::Int(*v.get(index)? as i32),
            ArrayStorage::Int(v) => Value::Int(*v.get(index)?),
            ArrayStorage::Long(v) => Value::Long(*v.get(index)?),
            ArrayStorage::Float(v) => Value::Float(*v.get(index)?),
            ArrayStorage::Double(v) => Value::Double(*v.get(index)?),
            ArrayStorage::Reference(v) => Value::Ref(*v.get(index)?),
        })
    }

    /// Stores with the truncation of the element type. Returns false when
    /// `index` is out of bounds.
    pub fn store(&mut self, index: usize, value: Value) -> bool {
        if index >= self.len() {
            return false;
        }
        match (self, value) {
            (ArrayStorage::Boolean(v), Value::Int(i)) => v[index] = (i & 1) as i8,
            (ArrayStorage::Byte(v), Value::Int(i)) => v[index] = i as i8,
            (ArrayStorage::Char(v), Value::Int(i)) => v[index] = i as u16,
            (ArrayStorage::Short(v), Value::Int(i)) => v[index] = i as i16,
            (ArrayStorage::Int(v), Value::Int(i)) => v[index] = i,
            (ArrayStorage::Long(v), Value::Long(l)) => v[index] = l,
            (ArrayStorage::Float(v), Value::Float(f)) => v[index] = f,
            (ArrayStorage::Double(v), Value::Double(d)) => v[index] = d,
            (ArrayStorage::Reference(v), Value::Ref(r)) => v[index] = r,
            (storage, value) => panic!("cannot store {value:?} into {storage:?}"),
        }
        true
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HeapStorage {
    /// Instance fields in layout order.
    Instance(Vec<Value>),
    Array(ArrayStorage),
    String(String),
    /// The `java/lang/Class` object standing for a loaded class.
    Mirror(ClassId),
}

#[derive(Clone, Debug)]
pub struct HeapObject {
    pub class: ClassId,
    pub storage: HeapStorage,
    /// Detail message of throwables.
    pub message: Option<String>,
}

/// An append-only object table. Every object gets an aligned address above
/// [`HEAP_BASE`]; objects are never moved or freed.
#[derive(Default)]
pub struct Heap {
    objects: RwLock<Vec<HeapObject>>,
    interned: Mutex<HashMap<String, ObjectRef>>,
    mirrors: Mutex<HashMap<ClassId, ObjectRef>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest address the heap may ever hand out.
    pub fn limit(&self) -> u64 {
        HEAP_BASE + HEAP_RESERVED
    }

    fn address_of(index: usize) -> ObjectRef {
        ObjectRef::from_address(HEAP_BASE + ((index as u64 + 1) << OBJECT_ALIGNMENT_SHIFT))
    }

    fn index_of(object: ObjectRef) -> usize {
        assert!(!object.is_null(), "null dereferenced inside the heap");
        (((object.address() - HEAP_BASE) >> OBJECT_ALIGNMENT_SHIFT) - 1) as usize
    }

    fn allocate(&self, object: HeapObject) -> ObjectRef {
        let mut objects = self.objects.write();
        let reference = Self::address_of(objects.len());
        assert!(reference.address() <= self.limit(), "heap exhausted");
        objects.push(object);
        reference
    }

    fn with<T>(&self, object: ObjectRef, f: impl FnOnce(&HeapObject) -> T) -> T {
        f(&self.objects.read()[Self::index_of(object)])
    }

    fn with_mut<T>(&self, object: ObjectRef, f: impl FnOnce(&mut HeapObject) -> T) -> T {
        f(&mut self.objects.write()[Self::index_of(object)])
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn new_instance(&self, class: &ClassDescription, resolver: &dyn Resolver) -> ObjectRef {
        let fields = class
            .instance_fields
            .iter()
            .map(|f| Value::default_for(resolver.field(*f).field_type))
            .collect();
        self.allocate(HeapObject {
            class: class.id,
            storage: HeapStorage::Instance(fields),
            message: None,
        })
    }

    pub fn new_array(&self, class: ClassId, element: ArrayElement, length: usize) -> ObjectRef {
        self.allocate(HeapObject {
            class,
            storage: HeapStorage::Array(ArrayStorage::new(element, length)),
            message: None,
        })
    }

    /// The unique string object with contents `value`.
    pub fn intern(&self, value: &str, string_class: ClassId) -> ObjectRef {
        let mut interned = self.interned.lock();
        if let Some(&r) = interned.get(value) {
            return r;
        }
        let r = self.allocate(HeapObject {
            class: string_class,
            storage: HeapStorage::String(value.to_string()),
            message: None,
        });
        interned.insert(value.to_string(), r);
        r
    }

    /// The unique mirror object of `class`.
    pub fn mirror(&self, class: ClassId, class_class: ClassId) -> ObjectRef {
        *self.mirrors.lock().entry(class).or_insert_with(|| {
            self.allocate(HeapObject {
                class: class_class,
                storage: HeapStorage::Mirror(class),
                message: None,
            })
        })
    }

    pub fn class_of(&self, object: ObjectRef) -> ClassId {
        self.with(object, |o| o.class)
    }

    pub fn get_field(&self, object: ObjectRef, slot: usize) -> Value {
        self.with(object, |o| match &o.storage {
            HeapStorage::Instance(fields) => fields[slot],
            s => panic!("field read on non-instance {s:?}"),
        })
    }

    pub fn set_field(&self, object: ObjectRef, slot: usize, value: Value) {
        self.with_mut(object, |o| match &mut o.storage {
            HeapStorage::Instance(fields) => fields[slot] = value,
            s => panic!("field write on non-instance {s:?}"),
        })
    }

    /// `None` if `object` is not an array.
    pub fn array_length(&self, object: ObjectRef) -> Option<usize> {
        self.with(object, |o| match &o.storage {
            HeapStorage::Array(a) => Some(a.len()),
            _ => None,
        })
    }

    /// `None` if `index` is out of bounds.
    pub fn array_load(&self, object: ObjectRef, index: usize) -> Option<Value> {
        self.with(object, |o| match &o.storage {
            HeapStorage::Array(a) => a.load(index),
            s => panic!("array load on {s:?}"),
        })
    }

    /// Returns false if `index` is out of bounds.
    pub fn array_store(&self, object: ObjectRef, index: usize, value: Value) -> bool {
        self.with_mut(object, |o| match &mut o.storage {
            HeapStorage::Array(a) => a.store(index, value),
            s => panic!("array store on {s:?}"),
        })
    }

    pub fn with_array<T>(&self, object: ObjectRef, f: impl FnOnce(&ArrayStorage) -> T) -> Option<T> {
        self.with(object, |o| match &o.storage {
            HeapStorage::Array(a) => Some(f(a)),
            _ => None,
        })
    }

    pub fn string_value(&self, object: ObjectRef) -> Option<String> {
        self.with(object, |o| match &o.storage {
            HeapStorage::String(s) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn mirrored_class(&self, object: ObjectRef) -> Option<ClassId> {
        self.with(object, |o| match o.storage {
            HeapStorage::Mirror(c) => Some(c),
            _ => None,
        })
    }

    pub fn set_message(&self, object: ObjectRef, message: Option<String>) {
        self.with_mut(object, |o| o.message = message)
    }

    pub fn message(&self, object: ObjectRef) -> Option<String> {
        self.with(object, |o| o.message.clone())
    }

    /// References held by the heap itself: interned strings and mirrors.
    pub fn permanent_roots(&self) -> Vec<ObjectRef> {
        let mut roots: Vec<_> = self.interned.lock().values().copied().collect();
        roots.extend(self.mirrors.lock().values().copied());
        roots
    }
}

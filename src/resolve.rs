use crate::{
    error::{DefinitionError, ResolutionError},
    types::{
        AccessFlags, ArrayElement, BasicType, ClassDescription, ClassId, FieldDescription,
        FieldId, HandlerEntry, MethodCode, MethodDescription, MethodId, MethodSignature,
        NativeBinding, WellKnown,
    },
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// Symbolic entries of a class's constant pool. Index 0 is never used.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstantPoolEntry {
    Empty,
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(String),
    Field {
        class: String,
        name: String,
        descriptor: String,
    },
    Method {
        class: String,
        name: String,
        descriptor: String,
    },
    InterfaceMethod {
        class: String,
        name: String,
        descriptor: String,
    },
}

/// A loadable constant after linking.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(ClassId),
}

/// Maps symbolic references to loaded classes, fields and methods.
///
/// The interpreter suspends its own safe-point polling around every call,
/// so implementations are free to block or run guest code.
pub trait Resolver: Send + Sync {
    fn class(&self, id: ClassId) -> Arc<ClassDescription>;
    fn method(&self, id: MethodId) -> Arc<MethodDescription>;
    fn field(&self, id: FieldId) -> Arc<FieldDescription>;

    fn class_named(&self, name: &str) -> Result<ClassId, ResolutionError>;
    fn resolve_class(&self, container: ClassId, index: u16) -> Result<ClassId, ResolutionError>;
    fn resolve_field(&self, container: ClassId, index: u16) -> Result<FieldId, ResolutionError>;
    /// Resolves both class and interface method references.
    fn resolve_method(&self, container: ClassId, index: u16)
        -> Result<MethodId, ResolutionError>;
    fn resolve_constant(&self, container: ClassId, index: u16)
        -> Result<Constant, ResolutionError>;

    fn array_class(&self, element: ArrayElement) -> ClassId;
    /// Searches `class` and then its superclasses.
    fn find_method(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId>;
    /// Whether a value of class `from` may be stored where `to` is expected.
    fn is_assignable(&self, from: ClassId, to: ClassId) -> bool;
    fn well_known(&self, class: WellKnown) -> ClassId;
}

pub struct MethodBuilder {
    name: String,
    descriptor: String,
    flags: AccessFlags,
    code: Option<MethodCode>,
    native: Option<NativeBinding>,
}

impl MethodBuilder {
    pub fn new(name: &str, descriptor: &str, flags: AccessFlags) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags,
            code: None,
            native: None,
        }
    }

    pub fn code(mut self, max_stack: u16, max_locals: u16, bytecode: Vec<u8>) -> Self {
        self.code = Some(MethodCode {
            max_stack,
            max_locals,
            bytecode,
            handlers: vec![],
        });
        self
    }

    /// Appends a handler row; rows are searched in the order added.
    pub fn handler(mut self, start_pc: u16, end_pc: u16, handler_pc: u16, catch_type: u16) -> Self {
        if let Some(code) = &mut self.code {
            code.handlers.push(HandlerEntry {
                start_pc,
                end_pc,
                handler_pc,
                catch_type,
            });
        }
        self
    }

    pub fn native(mut self, binding: NativeBinding) -> Self {
        self.flags |= AccessFlags::NATIVE;
        self.native = Some(binding);
        self
    }
}

struct FieldBuilder {
    name: String,
    descriptor: String,
    flags: AccessFlags,
}

/// Collects the pieces of a class before it is handed to
/// [`ClassRegistry::define`].
pub struct ClassBuilder {
    name: String,
    flags: AccessFlags,
    super_name: Option<String>,
    interfaces: Vec<String>,
    pool: Vec<ConstantPoolEntry>,
    methods: Vec<MethodBuilder>,
    fields: Vec<FieldBuilder>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            flags: AccessFlags::PUBLIC,
            super_name: Some(WellKnown::Object.class_name().to_string()),
            interfaces: vec![],
            pool: vec![ConstantPoolEntry::Empty],
            methods: vec![],
            fields: vec![],
        }
    }

    pub fn new_interface(name: &str) -> Self {
        let mut builder = Self::new(name);
        builder.flags |= AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
        builder
    }

    pub fn extends(&mut self, super_name: &str) -> &mut Self {
        self.super_name = Some(super_name.to_string());
        self
    }

    pub fn flags(&mut self, flags: AccessFlags) -> &mut Self {
        self.flags |= flags;
        self
    }

    pub fn implements(&mut self, interface: &str) -> &mut Self {
        self.interfaces.push(interface.to_string());
        self
    }

    pub fn method(&mut self, method: MethodBuilder) -> &mut Self {
        self.methods.push(method);
        self
    }

    pub fn field(&mut self, name: &str, descriptor: &str, flags: AccessFlags) -> &mut Self {
        self.fields.push(FieldBuilder {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags,
        });
        self
    }

    /// Adds `entry` to the pool, reusing an equal one, and returns its index.
    pub fn constant(&mut self, entry: ConstantPoolEntry) -> u16 {
        if let Some(i) = self.pool.iter().skip(1).position(|e| *e == entry) {
            return (i + 1) as u16;
        }
        self.pool.push(entry);
        (self.pool.len() - 1) as u16
    }

    pub fn int(&mut self, value: i32) -> u16 {
        self.constant(ConstantPoolEntry::Int(value))
    }

    pub fn long(&mut self, value: i64) -> u16 {
        self.constant(ConstantPoolEntry::Long(value))
    }

    pub fn float(&mut self, value: f32) -> u16 {
        self.constant(ConstantPoolEntry::Float(value))
    }

    pub fn double(&mut self, value: f64) -> u16 {
        self.constant(ConstantPoolEntry::Double(value))
    }

    pub fn string(&mut self, value: &str) -> u16 {
        self.constant(ConstantPoolEntry::String(value.to_string()))
    }

    pub fn class_ref(&mut self, class: &str) -> u16 {
        self.constant(ConstantPoolEntry::Class(class.to_string()))
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.constant(ConstantPoolEntry::Field {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.constant(ConstantPoolEntry::Method {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.constant(ConstantPoolEntry::InterfaceMethod {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }
}

#[derive(Default)]
struct RegistryState {
    classes: Vec<Arc<ClassDescription>>,
    methods: Vec<Arc<MethodDescription>>,
    fields: Vec<Arc<FieldDescription>>,
    pools: Vec<Vec<ConstantPoolEntry>>,
    by_name: HashMap<String, ClassId>,
    arrays: HashMap<ArrayElement, ClassId>,
    well_known: Vec<ClassId>,
}

impl RegistryState {
    fn class(&self, id: ClassId) -> &ClassDescription {
        &self.classes[id.index()]
    }

    fn superclasses(&self, start: ClassId) -> impl Iterator<Item = ClassId> + '_ {
        std::iter::successors(Some(start), |c| self.class(*c).super_class)
    }

    fn declared_method(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        self.class(class).methods.iter().copied().find(|m| {
            let m = &self.methods[m.index()];
            m.name == name && m.descriptor == descriptor
        })
    }

    fn find_method(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        self.superclasses(class)
            .find_map(|c| self.declared_method(c, name, descriptor))
    }

    fn find_interface_method(
        &self,
        interface: ClassId,
        name: &str,
        descriptor: &str,
    ) -> Option<MethodId> {
        let mut pending = vec![interface];
        while let Some(i) = pending.pop() {
            if let Some(m) = self.declared_method(i, name, descriptor) {
                return Some(m);
            }
            pending.extend(self.class(i).interfaces.iter().copied());
        }
        let object = self.well_known[WellKnown::Object as usize];
        self.declared_method(object, name, descriptor)
    }

    fn implements(&self, class: ClassId, interface: ClassId) -> bool {
        self.superclasses(class).any(|c| {
            let mut pending = self.class(c).interfaces.clone();
            while let Some(i) = pending.pop() {
                if i == interface {
                    return true;
                }
                pending.extend(self.class(i).interfaces.iter().copied());
            }
            false
        })
    }

    fn is_assignable(&self, from: ClassId, to: ClassId) -> bool {
        if from == to || to == self.well_known[WellKnown::Object as usize] {
            return true;
        }
        let target = self.class(to);
        let source = self.class(from);
        match (source.element, target.element) {
            (Some(ArrayElement::Primitive(a)), Some(ArrayElement::Primitive(b))) => a == b,
            (Some(ArrayElement::Reference(a)), Some(ArrayElement::Reference(b))) => {
                self.is_assignable(a, b)
            }
            (Some(_), _) | (None, Some(_)) => false,
            (None, None) if target.is_interface() => self.implements(from, to),
            (None, None) => self.superclasses(from).any(|c| c == to),
        }
    }

    fn array_name(&self, element: ArrayElement) -> String {
        match element {
            ArrayElement::Primitive(t) => format!("[{}", t.descriptor_char()),
            ArrayElement::Reference(c) => {
                let inner = self.class(c);
                if inner.is_array() {
                    format!("[{}", inner.name)
                } else {
                    format!("[L{};", inner.name)
                }
            }
        }
    }

    fn pool_entry(&self, container: ClassId, index: u16) -> &ConstantPoolEntry {
        static EMPTY: ConstantPoolEntry = ConstantPoolEntry::Empty;
        self.pools[container.index()]
            .get(index as usize)
            .unwrap_or(&EMPTY)
    }
}

/// An in-memory class table implementing [`Resolver`].
///
/// It starts out holding `java/lang/Object` and every class the interpreter
/// may need to raise; guest classes are added with [`ClassRegistry::define`].
pub struct ClassRegistry {
    state: RwLock<RegistryState>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        let registry = Self {
            state: RwLock::new(RegistryState::default()),
        };

        for &wk in WellKnown::ALL {
            let mut builder = ClassBuilder::new(wk.class_name());
            builder.super_name = wk.super_name().map(str::to_string);
            if matches!(wk, WellKnown::Object | WellKnown::Throwable) {
                builder.method(
                    MethodBuilder::new("<init>", "()V", AccessFlags::PUBLIC).code(0, 1, vec![0xb1]),
                );
            }
            let id = registry
                .define(builder)
                .expect("bootstrap classes are well formed");
            registry.state.write().well_known.push(id);
        }

        registry
    }

    pub fn define(&self, builder: ClassBuilder) -> Result<ClassId, DefinitionError> {
        let mut state = self.state.write();
        let class_name = builder.name.clone();
        if state.by_name.contains_key(&class_name) {
            return Err(DefinitionError::Duplicate(class_name));
        }
        let undefined = |missing: &str| DefinitionError::Undefined {
            class: class_name.clone(),
            missing: missing.to_string(),
        };

        let super_class = match &builder.super_name {
            Some(s) => Some(*state.by_name.get(s).ok_or_else(|| undefined(s))?),
            None => None,
        };
        let mut interfaces = vec![];
        for name in &builder.interfaces {
            let id = *state.by_name.get(name).ok_or_else(|| undefined(name))?;
            if !state.class(id).is_interface() {
                return Err(DefinitionError::NotAnInterface(name.clone()));
            }
            interfaces.push(id);
        }

        // validate everything before the tables are touched
        let mut field_types = vec![];
        for f in &builder.fields {
            match f.descriptor.chars().next().and_then(BasicType::from_descriptor_char) {
                Some(BasicType::Void) | None => {
                    return Err(DefinitionError::BadDescriptor(f.descriptor.clone()))
                }
                Some(t) => field_types.push(t),
            }
        }
        let mut signatures = vec![];
        for m in &builder.methods {
            signatures.push(MethodSignature::parse(&m.descriptor)?);
            let bodiless = !m.flags.intersects(AccessFlags::NATIVE | AccessFlags::ABSTRACT);
            if m.code.is_none() && bodiless {
                return Err(DefinitionError::MissingBody(format!(
                    "{}.{}{}",
                    class_name, m.name, m.descriptor
                )));
            }
        }

        let id = ClassId(state.classes.len() as u32);
        let is_interface = builder.flags.contains(AccessFlags::INTERFACE);
        let parent = super_class.map(|s| state.classes[s.index()].clone());
        let mut vtable = parent.as_ref().map(|p| p.vtable.clone()).unwrap_or_default();
        let mut instance_fields = parent
            .as_ref()
            .map(|p| p.instance_fields.clone())
            .unwrap_or_default();
        let mut static_fields = vec![];

        for (f, field_type) in builder.fields.into_iter().zip(field_types) {
            let field_id = FieldId(state.fields.len() as u32);
            let is_static = f.flags.contains(AccessFlags::STATIC);
            let slot = if is_static {
                static_fields.push(field_id);
                0
            } else {
                instance_fields.push(field_id);
                instance_fields.len() - 1
            };
            state.fields.push(Arc::new(FieldDescription {
                id: field_id,
                class: id,
                name: f.name,
                descriptor: f.descriptor,
                flags: f.flags,
                field_type,
                slot,
            }));
        }

        let mut methods = vec![];
        for (m, signature) in builder.methods.into_iter().zip(signatures) {
            let method_id = MethodId(state.methods.len() as u32);
            let dispatched = !is_interface
                && !m.flags.intersects(AccessFlags::STATIC | AccessFlags::PRIVATE)
                && !m.name.starts_with('<');
            let vtable_index = if dispatched {
                let overridden = vtable.iter().position(|v| {
                    let o = &state.methods[v.index()];
                    o.name == m.name && o.descriptor == m.descriptor
                });
                Some(match overridden {
                    Some(i) => {
                        vtable[i] = method_id;
                        i
                    }
                    None => {
                        vtable.push(method_id);
                        vtable.len() - 1
                    }
                })
            } else {
                None
            };
            state.methods.push(Arc::new(MethodDescription {
                id: method_id,
                class: id,
                name: m.name,
                descriptor: m.descriptor,
                flags: m.flags,
                signature,
                vtable_index,
                code: m.code,
                native: m.native,
            }));
            methods.push(method_id);
        }

        tracing::debug!(class = %class_name, ?id, "defined class");
        state.classes.push(Arc::new(ClassDescription {
            id,
            name: class_name.clone(),
            flags: builder.flags,
            super_class,
            interfaces,
            methods,
            vtable,
            instance_fields,
            static_fields,
            element: None,
        }));
        state.pools.push(builder.pool);
        state.by_name.insert(class_name, id);
        Ok(id)
    }

    fn array_of(&self, element: ArrayElement) -> ClassId {
        if let Some(&id) = self.state.read().arrays.get(&element) {
            return id;
        }
        let mut state = self.state.write();
        if let Some(&id) = state.arrays.get(&element) {
            return id;
        }
        let object = state.well_known[WellKnown::Object as usize];
        let id = ClassId(state.classes.len() as u32);
        let name = state.array_name(element);
        let vtable = state.class(object).vtable.clone();
        state.classes.push(Arc::new(ClassDescription {
            id,
            name: name.clone(),
            flags: AccessFlags::PUBLIC | AccessFlags::FINAL,
            super_class: Some(object),
            interfaces: vec![],
            methods: vec![],
            vtable,
            instance_fields: vec![],
            static_fields: vec![],
            element: Some(element),
        }));
        state.pools.push(vec![ConstantPoolEntry::Empty]);
        state.by_name.insert(name, id);
        state.arrays.insert(element, id);
        id
    }

    fn bad_constant(&self, container: ClassId, index: u16, expected: &'static str) -> ResolutionError {
        ResolutionError::BadConstant {
            class: self.class(container).name.clone(),
            index,
            expected,
        }
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for ClassRegistry {
    fn class(&self, id: ClassId) -> Arc<ClassDescription> {
        self.state.read().classes[id.index()].clone()
    }

    fn method(&self, id: MethodId) -> Arc<MethodDescription> {
        self.state.read().methods[id.index()].clone()
    }

    fn field(&self, id: FieldId) -> Arc<FieldDescription> {
        self.state.read().fields[id.index()].clone()
    }

    fn class_named(&self, name: &str) -> Result<ClassId, ResolutionError> {
        if let Some(&id) = self.state.read().by_name.get(name) {
            return Ok(id);
        }
        let Some(component) = name.strip_prefix('[') else {
            return Err(ResolutionError::NoClassDef(name.to_string()));
        };
        let element = if let Some(inner) = component
            .strip_prefix('L')
            .and_then(|c| c.strip_suffix(';'))
        {
            ArrayElement::Reference(self.class_named(inner)?)
        } else if component.starts_with('[') {
            ArrayElement::Reference(self.class_named(component)?)
        } else {
            match component.chars().next().and_then(BasicType::from_descriptor_char) {
                Some(t) if component.len() == 1 && !matches!(t, BasicType::Void | BasicType::Reference) => {
                    ArrayElement::Primitive(t)
                }
                _ => return Err(ResolutionError::NoClassDef(name.to_string())),
            }
        };
        Ok(self.array_of(element))
    }

    fn resolve_class(&self, container: ClassId, index: u16) -> Result<ClassId, ResolutionError> {
        let entry = self.state.read().pool_entry(container, index).clone();
        match entry {
            ConstantPoolEntry::Class(name) => self.class_named(&name),
            _ => Err(self.bad_constant(container, index, "class")),
        }
    }

    fn resolve_field(&self, container: ClassId, index: u16) -> Result<FieldId, ResolutionError> {
        let entry = self.state.read().pool_entry(container, index).clone();
        let ConstantPoolEntry::Field {
            class,
            name,
            descriptor,
        } = entry
        else {
            return Err(self.bad_constant(container, index, "field"));
        };
        let owner = self.class_named(&class)?;

        let state = self.state.read();
        let found = state.superclasses(owner).find_map(|c| {
            let c = state.class(c);
            c.instance_fields
                .iter()
                .chain(&c.static_fields)
                .copied()
                .find(|f| {
                    let f = &state.fields[f.index()];
                    f.name == name && f.descriptor == descriptor
                })
        });
        found.ok_or(ResolutionError::NoSuchField {
            class,
            name,
            descriptor,
        })
    }

    fn resolve_method(
        &self,
        container: ClassId,
        index: u16,
    ) -> Result<MethodId, ResolutionError> {
        let entry = self.state.read().pool_entry(container, index).clone();
        let (class, name, descriptor, interface) = match entry {
            ConstantPoolEntry::Method {
                class,
                name,
                descriptor,
            } => (class, name, descriptor, false),
            ConstantPoolEntry::InterfaceMethod {
                class,
                name,
                descriptor,
            } => (class, name, descriptor, true),
            _ => return Err(self.bad_constant(container, index, "method")),
        };
        let owner = self.class_named(&class)?;

        let state = self.state.read();
        if state.class(owner).is_interface() != interface {
            return Err(ResolutionError::IncompatibleClassChange(format!(
                "{} referenced as {}",
                class,
                if interface { "an interface" } else { "a class" }
            )));
        }
        let found = if interface {
            state.find_interface_method(owner, &name, &descriptor)
        } else {
            state.find_method(owner, &name, &descriptor)
        };
        found.ok_or(ResolutionError::NoSuchMethod {
            class,
            name,
            descriptor,
        })
    }

    fn resolve_constant(
        &self,
        container: ClassId,
        index: u16,
    ) -> Result<Constant, ResolutionError> {
        let entry = self.state.read().pool_entry(container, index).clone();
        Ok(match entry {
            ConstantPoolEntry::Int(i) => Constant::Int(i),
            ConstantPoolEntry::Float(f) => Constant::Float(f),
            ConstantPoolEntry::Long(l) => Constant::Long(l),
            ConstantPoolEntry::Double(d) => Constant::Double(d),
            ConstantPoolEntry::String(s) => Constant::String(s),
            ConstantPoolEntry::Class(name) => Constant::Class(self.class_named(&name)?),
            _ => return Err(self.bad_constant(container, index, "loadable constant")),
        })
    }

    fn array_class(&self, element: ArrayElement) -> ClassId {
        self.array_of(element)
    }

    fn find_method(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        self.state.read().find_method(class, name, descriptor)
    }

    fn is_assignable(&self, from: ClassId, to: ClassId) -> bool {
        self.state.read().is_assignable(from, to)
    }

    fn well_known(&self, class: WellKnown) -> ClassId {
        self.state.read().well_known[class as usize]
    }
}

use crate::{
    error::NativeError,
    types::{BasicType, MethodDescription, NativeBinding},
    value::{ObjectRef, Value},
};
use libffi::middle::*;
use libloading::{Library, Symbol};
use parking_lot::Mutex;
use std::{collections::HashMap, ffi::c_void};

/// Performs calls across the native boundary.
///
/// `args` holds the receiver first for instance methods, then the declared
/// parameters; sub-int parameters arrive as `Value::Int`. The returned value
/// is narrowed by the interpreter per the declared return type.
pub trait NativeInvoker: Send + Sync {
    fn invoke(&self, method: &MethodDescription, args: &[Value]) -> Result<Option<Value>, NativeError>;
}

/// Loaded shared libraries and the addresses of symbols already looked up.
#[derive(Default)]
pub struct NativeLibraries {
    libraries: Mutex<HashMap<String, Library>>,
    symbols: Mutex<HashMap<(String, String), usize>>,
}

impl NativeLibraries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_function(&self, library: &str, name: &str) -> Result<usize, NativeError> {
        let key = (library.to_string(), name.to_string());
        if let Some(&address) = self.symbols.lock().get(&key) {
            return Ok(address);
        }

        let mut libraries = self.libraries.lock();
        if !libraries.contains_key(library) {
            tracing::debug!(library, "loading native library");
            let loaded = unsafe { Library::new(library) }?;
            libraries.insert(library.to_string(), loaded);
        }
        let Some(l) = libraries.get(library) else {
            unreachable!("library inserted above")
        };
        let sym: Symbol<unsafe extern "C" fn()> = unsafe { l.get(name.as_bytes()) }?;
        let address = *sym as usize;
        self.symbols.lock().insert(key, address);
        Ok(address)
    }
}

/// A marshaled argument. Each variant owns the exact C representation its
/// parameter type calls for.
#[derive(Clone, Copy, Debug)]
enum NativeArg {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(usize),
}

impl NativeArg {
    fn as_arg(&self) -> Arg {
        match self {
            NativeArg::U8(v) => Arg::new(v),
            NativeArg::I8(v) => Arg::new(v),
            NativeArg::U16(v) => Arg::new(v),
            NativeArg::I16(v) => Arg::new(v),
            NativeArg::I32(v) => Arg::new(v),
            NativeArg::I64(v) => Arg::new(v),
            NativeArg::F32(v) => Arg::new(v),
            NativeArg::F64(v) => Arg::new(v),
            NativeArg::Pointer(v) => Arg::new(v),
        }
    }
}

fn ffi_type(t: BasicType) -> Type {
    match t {
        BasicType::Boolean => Type::u8(),
        BasicType::Byte => Type::i8(),
        BasicType::Char => Type::u16(),
        BasicType::Short => Type::i16(),
        BasicType::Int => Type::i32(),
        BasicType::Long => Type::i64(),
        BasicType::Float => Type::f32(),
        BasicType::Double => Type::f64(),
        BasicType::Reference => Type::pointer(),
        BasicType::Void => Type::void(),
    }
}

fn marshal(t: BasicType, value: &Value) -> Result<NativeArg, NativeError> {
    Ok(match (t, value) {
        (BasicType::Boolean, Value::Int(i)) => NativeArg::U8((*i != 0) as u8),
        (BasicType::Byte, Value::Int(i)) => NativeArg::I8(*i as i8),
        (BasicType::Char, Value::Int(i)) => NativeArg::U16(*i as u16),
        (BasicType::Short, Value::Int(i)) => NativeArg::I16(*i as i16),
        (BasicType::Int, Value::Int(i)) => NativeArg::I32(*i),
        (BasicType::Long, Value::Long(l)) => NativeArg::I64(*l),
        (BasicType::Float, Value::Float(f)) => NativeArg::F32(*f),
        (BasicType::Double, Value::Double(d)) => NativeArg::F64(*d),
        (BasicType::Reference, Value::Ref(r)) => NativeArg::Pointer(r.address() as usize),
        (t, _) => return Err(NativeError::UnsupportedType(t)),
    })
}

/// Calls C-ABI functions through `libffi`.
///
/// References cross as raw addresses; booleans as `u8`, chars as `u16`.
#[derive(Default)]
pub struct FfiInvoker {
    libraries: NativeLibraries,
}

impl FfiInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    fn target(&self, method: &MethodDescription) -> Result<CodePtr, NativeError> {
        let address = match &method.native {
            Some(NativeBinding::Address(a)) => *a,
            Some(NativeBinding::Library { library, symbol }) => {
                self.libraries.get_function(library, symbol)?
            }
            None => return Err(NativeError::UnsatisfiedLink(format!("{method:?}"))),
        };
        Ok(CodePtr::from_ptr(address as *const c_void))
    }
}

impl NativeInvoker for FfiInvoker {
    fn invoke(&self, method: &MethodDescription, args: &[Value]) -> Result<Option<Value>, NativeError> {
        let target = self.target(method)?;

        let mut types = vec![];
        if !method.is_static() {
            types.push(BasicType::Reference);
        }
        types.extend(method.signature.parameters.iter().copied());

        let marshaled = types
            .iter()
            .zip(args)
            .map(|(t, v)| marshal(*t, v))
            .collect::<Result<Vec<_>, _>>()?;
        let arg_values: Vec<Arg> = marshaled.iter().map(NativeArg::as_arg).collect();

        let return_type = method.return_type();
        let cif = Cif::new(types.iter().map(|t| ffi_type(*t)), ffi_type(return_type));

        macro_rules! read_return {
            ($t:ty) => {
                unsafe { cif.call::<$t>(target, &arg_values) }
            };
        }

        // integral results narrower than a register come back widened
        let v = match return_type {
            BasicType::Void => {
                read_return!(());
                return Ok(None);
            }
            BasicType::Boolean => Value::Int((read_return!(u64) as u8 != 0) as i32),
            BasicType::Byte => Value::Int(read_return!(i64) as i8 as i32),
            BasicType::Char => Value::Int(read_return!(u64) as u16 as i32),
            BasicType::Short => Value::Int(read_return!(i64) as i16 as i32),
            BasicType::Int => Value::Int(read_return!(i64) as i32),
            BasicType::Long => Value::Long(read_return!(i64)),
            BasicType::Float => Value::Float(read_return!(f32)),
            BasicType::Double => Value::Double(read_return!(f64)),
            BasicType::Reference => Value::Ref(ObjectRef::from_address(read_return!(usize) as u64)),
        };
        Ok(Some(v))
    }
}

use bitflags::bitflags;
use std::fmt::{self, Debug, Display, Formatter};

pub mod members;

pub use members::*;

macro_rules! id_type {
    ($($(#[$attr:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);

            impl $name {
                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl Debug for $name {
                fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                    write!(f, "{}#{}", stringify!($name), self.0)
                }
            }
        )+
    };
}

id_type! {
    /// Handle to a loaded class.
    ClassId,
    /// Handle to a method of a loaded class.
    MethodId,
    /// Handle to a field of a loaded class.
    FieldId,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
    }
}

/// The value categories a descriptor can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BasicType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,
    Void,
}

impl BasicType {
    pub fn slot_count(self) -> usize {
        match self {
            BasicType::Long | BasicType::Double => 2,
            BasicType::Void => 0,
            _ => 1,
        }
    }

    pub fn is_wide(self) -> bool {
        self.slot_count() == 2
    }

    pub fn from_descriptor_char(c: char) -> Option<Self> {
        Some(match c {
            'Z' => BasicType::Boolean,
            'B' => BasicType::Byte,
            'C' => BasicType::Char,
            'S' => BasicType::Short,
            'I' => BasicType::Int,
            'J' => BasicType::Long,
            'F' => BasicType::Float,
            'D' => BasicType::Double,
            'L' | '[' => BasicType::Reference,
            'V' => BasicType::Void,
            _ => return None,
        })
    }

    pub fn descriptor_char(self) -> char {
        match self {
            BasicType::Boolean => 'Z',
            BasicType::Byte => 'B',
            BasicType::Char => 'C',
            BasicType::Short => 'S',
            BasicType::Int => 'I',
            BasicType::Long => 'J',
            BasicType::Float => 'F',
            BasicType::Double => 'D',
            BasicType::Reference => 'L',
            BasicType::Void => 'V',
        }
    }

    /// Element type selected by a `newarray` operand.
    pub fn from_array_type_code(code: u8) -> Option<Self> {
        Some(match code {
            4 => BasicType::Boolean,
            5 => BasicType::Char,
            6 => BasicType::Float,
            7 => BasicType::Double,
            8 => BasicType::Byte,
            9 => BasicType::Short,
            10 => BasicType::Int,
            11 => BasicType::Long,
            _ => return None,
        })
    }

    pub fn array_type_code(self) -> Option<u8> {
        (4..=11).find(|c| Self::from_array_type_code(*c) == Some(self))
    }
}

/// Component of an array class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArrayElement {
    Primitive(BasicType),
    Reference(ClassId),
}

pub struct ClassDescription {
    pub id: ClassId,
    pub name: String,
    pub flags: AccessFlags,
    pub super_class: Option<ClassId>,
    /// Directly declared interfaces.
    pub interfaces: Vec<ClassId>,
    pub methods: Vec<MethodId>,
    /// Virtual dispatch table, inherited slots first.
    pub vtable: Vec<MethodId>,
    /// Instance fields in layout order, inherited ones first.
    pub instance_fields: Vec<FieldId>,
    pub static_fields: Vec<FieldId>,
    pub element: Option<ArrayElement>,
}

impl ClassDescription {
    pub fn is_interface(&self) -> bool {
        self.flags.contains(AccessFlags::INTERFACE)
    }

    pub fn is_array(&self) -> bool {
        self.element.is_some()
    }
}

impl Debug for ClassDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Display for ClassDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

macro_rules! well_known {
    ($($variant:ident => $name:literal extends $parent:literal),+ $(,)?) => {
        /// Classes the interpreter itself needs to name: the root, strings,
        /// class mirrors and every exception it can raise.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum WellKnown {
            Object,
            $($variant),+
        }

        impl WellKnown {
            pub const ALL: &'static [WellKnown] = &[WellKnown::Object, $(WellKnown::$variant),+];

            pub fn class_name(self) -> &'static str {
                match self {
                    WellKnown::Object => "java/lang/Object",
                    $(WellKnown::$variant => $name),+
                }
            }

            pub fn super_name(self) -> Option<&'static str> {
                match self {
                    WellKnown::Object => None,
                    $(WellKnown::$variant => Some($parent)),+
                }
            }
        }
    };
}

// parents always precede their subclasses
well_known! {
    String => "java/lang/String" extends "java/lang/Object",
    Class => "java/lang/Class" extends "java/lang/Object",
    Throwable => "java/lang/Throwable" extends "java/lang/Object",
    Exception => "java/lang/Exception" extends "java/lang/Throwable",
    Error => "java/lang/Error" extends "java/lang/Throwable",
    RuntimeException => "java/lang/RuntimeException" extends "java/lang/Exception",
    NullPointerException => "java/lang/NullPointerException" extends "java/lang/RuntimeException",
    ArithmeticException => "java/lang/ArithmeticException" extends "java/lang/RuntimeException",
    IndexOutOfBoundsException => "java/lang/IndexOutOfBoundsException" extends "java/lang/RuntimeException",
    ArrayIndexOutOfBoundsException => "java/lang/ArrayIndexOutOfBoundsException" extends "java/lang/IndexOutOfBoundsException",
    ClassCastException => "java/lang/ClassCastException" extends "java/lang/RuntimeException",
    NegativeArraySizeException => "java/lang/NegativeArraySizeException" extends "java/lang/RuntimeException",
    ArrayStoreException => "java/lang/ArrayStoreException" extends "java/lang/RuntimeException",
    IllegalMonitorStateException => "java/lang/IllegalMonitorStateException" extends "java/lang/RuntimeException",
    LinkageError => "java/lang/LinkageError" extends "java/lang/Error",
    VerifyError => "java/lang/VerifyError" extends "java/lang/LinkageError",
    NoClassDefFoundError => "java/lang/NoClassDefFoundError" extends "java/lang/LinkageError",
    UnsatisfiedLinkError => "java/lang/UnsatisfiedLinkError" extends "java/lang/LinkageError",
    IncompatibleClassChangeError => "java/lang/IncompatibleClassChangeError" extends "java/lang/LinkageError",
    AbstractMethodError => "java/lang/AbstractMethodError" extends "java/lang/IncompatibleClassChangeError",
    IllegalAccessError => "java/lang/IllegalAccessError" extends "java/lang/IncompatibleClassChangeError",
    InstantiationError => "java/lang/InstantiationError" extends "java/lang/IncompatibleClassChangeError",
    NoSuchFieldError => "java/lang/NoSuchFieldError" extends "java/lang/IncompatibleClassChangeError",
    NoSuchMethodError => "java/lang/NoSuchMethodError" extends "java/lang/IncompatibleClassChangeError",
    VirtualMachineError => "java/lang/VirtualMachineError" extends "java/lang/Error",
    StackOverflowError => "java/lang/StackOverflowError" extends "java/lang/VirtualMachineError",
    InternalError => "java/lang/InternalError" extends "java/lang/VirtualMachineError",
}

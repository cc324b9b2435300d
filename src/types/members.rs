use crate::{
    error::DefinitionError,
    types::{AccessFlags, BasicType, ClassId, FieldId, MethodId},
};
use std::fmt::{self, Debug, Formatter};

/// Parameter and return types parsed from a method descriptor such as
/// `(IJLjava/lang/String;)V`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSignature {
    pub parameters: Vec<BasicType>,
    pub return_type: BasicType,
}

impl MethodSignature {
    pub fn parse(descriptor: &str) -> Result<Self, DefinitionError> {
        let bad = || DefinitionError::BadDescriptor(descriptor.to_string());
        let rest = descriptor.strip_prefix('(').ok_or_else(bad)?;
        let (params, ret) = rest.split_once(')').ok_or_else(bad)?;

        let mut parameters = vec![];
        let mut chars = params.chars();
        while let Some(c) = chars.next() {
            let mut c = c;
            while c == '[' {
                // every array is a single reference, whatever its element
                c = chars.next().ok_or_else(bad)?;
                if c != '[' {
                    if c == 'L' {
                        chars.by_ref().find(|&c| c == ';').ok_or_else(bad)?;
                    }
                    c = '[';
                    break;
                }
            }
            if c == 'L' {
                chars.by_ref().find(|&c| c == ';').ok_or_else(bad)?;
            }
            match BasicType::from_descriptor_char(c) {
                Some(BasicType::Void) | None => return Err(bad()),
                Some(t) => parameters.push(t),
            }
        }

        let return_type = ret
            .chars()
            .next()
            .and_then(BasicType::from_descriptor_char)
            .ok_or_else(bad)?;

        Ok(Self {
            parameters,
            return_type,
        })
    }

    /// Slots the parameters occupy, not counting a receiver.
    pub fn parameter_slots(&self) -> usize {
        self.parameters.iter().map(|p| p.slot_count()).sum()
    }
}

/// One row of a method's exception handler table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerEntry {
    pub start_pc: u16,
    /// Exclusive.
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Constant-pool index of the caught class, or [`HandlerEntry::ANY`].
    pub catch_type: u16,
}

impl HandlerEntry {
    /// Catch type of `finally` style handlers.
    pub const ANY: u16 = 0;

    pub fn covers(&self, pc: usize) -> bool {
        (self.start_pc as usize..self.end_pc as usize).contains(&pc)
    }

    pub fn catches_everything(&self) -> bool {
        self.catch_type == Self::ANY
    }
}

#[derive(Clone, Debug)]
pub struct MethodCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytecode: Vec<u8>,
    pub handlers: Vec<HandlerEntry>,
}

/// Where the native implementation of a method lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeBinding {
    /// Looked up lazily in a shared library.
    Library { library: String, symbol: String },
    /// An already resolved C-ABI function pointer.
    Address(usize),
}

pub struct MethodDescription {
    pub id: MethodId,
    pub class: ClassId,
    pub name: String,
    pub descriptor: String,
    pub flags: AccessFlags,
    pub signature: MethodSignature,
    /// Slot in the declaring class's vtable, for virtually dispatched methods.
    pub vtable_index: Option<usize>,
    pub code: Option<MethodCode>,
    pub native: Option<NativeBinding>,
}

impl MethodDescription {
    pub fn is_static(&self) -> bool {
        self.flags.contains(AccessFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(AccessFlags::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(AccessFlags::ABSTRACT)
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(AccessFlags::SYNCHRONIZED)
    }

    pub fn is_public(&self) -> bool {
        self.flags.contains(AccessFlags::PUBLIC)
    }

    /// Slots of the incoming arguments, receiver included.
    pub fn argument_slots(&self) -> usize {
        self.signature.parameter_slots() + usize::from(!self.is_static())
    }

    pub fn return_type(&self) -> BasicType {
        self.signature.return_type
    }
}

impl Debug for MethodDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor)
    }
}

pub struct FieldDescription {
    pub id: FieldId,
    pub class: ClassId,
    pub name: String,
    pub descriptor: String,
    pub flags: AccessFlags,
    pub field_type: BasicType,
    /// Position in the instance layout; unused for statics.
    pub slot: usize,
}

impl FieldDescription {
    pub fn is_static(&self) -> bool {
        self.flags.contains(AccessFlags::STATIC)
    }
}

impl Debug for FieldDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signature() {
        let sig = MethodSignature::parse("(IJLjava/lang/String;[[DZ)V").unwrap();
        assert_eq!(
            sig.parameters,
            vec![
                BasicType::Int,
                BasicType::Long,
                BasicType::Reference,
                BasicType::Reference,
                BasicType::Boolean
            ]
        );
        assert_eq!(sig.return_type, BasicType::Void);
        assert_eq!(sig.parameter_slots(), 5);

        let sig = MethodSignature::parse("([Ljava/lang/Object;)[I").unwrap();
        assert_eq!(sig.parameters, vec![BasicType::Reference]);
        assert_eq!(sig.return_type, BasicType::Reference);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(MethodSignature::parse("I)V").is_err());
        assert!(MethodSignature::parse("(V)V").is_err());
        assert!(MethodSignature::parse("(Ljava/lang/String)V").is_err());
        assert!(MethodSignature::parse("(I)").is_err());
    }

    #[test]
    fn test_handler_range_is_half_open() {
        let h = HandlerEntry {
            start_pc: 2,
            end_pc: 6,
            handler_pc: 10,
            catch_type: HandlerEntry::ANY,
        };
        assert!(!h.covers(1));
        assert!(h.covers(2));
        assert!(h.covers(5));
        assert!(!h.covers(6));
        assert!(h.catches_everything());
    }
}

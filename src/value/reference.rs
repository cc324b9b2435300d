use enum_dispatch::enum_dispatch;
use std::fmt::{self, Debug, Formatter};

/// Lowest address the heap ever hands out. Nothing lives at the base itself,
/// so a compressed offset of zero can always mean null.
pub const HEAP_BASE: u64 = 0x0008_0000_0000;
/// Objects are aligned to `1 << OBJECT_ALIGNMENT_SHIFT` bytes.
pub const OBJECT_ALIGNMENT_SHIFT: u32 = 3;

/// A full-width object reference. The all-zero address is null.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(u64);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);

    pub const fn from_address(address: u64) -> Self {
        Self(address)
    }

    pub const fn address(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Debug for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "@{:#x}", self.0)
        }
    }
}

/// Converts references to and from the raw bits stored in a slot.
#[enum_dispatch]
pub trait ReferenceCodec {
    fn encode(&self, reference: ObjectRef) -> u64;
    fn decode(&self, raw: u64) -> ObjectRef;
    fn is_compressed(&self) -> bool;
}

/// Slots hold the address itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Uncompressed;

impl ReferenceCodec for Uncompressed {
    #[inline]
    fn encode(&self, reference: ObjectRef) -> u64 {
        reference.0
    }

    #[inline]
    fn decode(&self, raw: u64) -> ObjectRef {
        ObjectRef(raw)
    }

    fn is_compressed(&self) -> bool {
        false
    }
}

/// Slots hold a 32-bit scaled offset from `base`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Compressed {
    pub base: u64,
    pub shift: u32,
}

impl Default for Compressed {
    fn default() -> Self {
        Self {
            base: HEAP_BASE,
            shift: OBJECT_ALIGNMENT_SHIFT,
        }
    }
}

impl Compressed {
    /// Highest address representable by this encoding.
    pub fn limit(&self) -> u64 {
        self.base + ((u32::MAX as u64) << self.shift)
    }
}

impl ReferenceCodec for Compressed {
    #[inline]
    fn encode(&self, reference: ObjectRef) -> u64 {
        if reference.is_null() {
            return 0;
        }
        debug_assert!(
            reference.0 > self.base && reference.0 <= self.limit(),
            "{reference:?} is outside the compressed range"
        );
        debug_assert_eq!((reference.0 - self.base) & ((1 << self.shift) - 1), 0);
        ((reference.0 - self.base) >> self.shift) as u32 as u64
    }

    #[inline]
    fn decode(&self, raw: u64) -> ObjectRef {
        let narrow = raw as u32;
        if narrow == 0 {
            ObjectRef::NULL
        } else {
            ObjectRef(self.base + ((narrow as u64) << self.shift))
        }
    }

    fn is_compressed(&self) -> bool {
        true
    }
}

/// Compression decided once at startup from the heap's reserved span.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Switchable {
    compressed: Option<Compressed>,
}

impl Switchable {
    pub fn detect(heap_limit: u64) -> Self {
        let candidate = Compressed::default();
        Self {
            compressed: (heap_limit <= candidate.limit()).then_some(candidate),
        }
    }
}

impl ReferenceCodec for Switchable {
    #[inline]
    fn encode(&self, reference: ObjectRef) -> u64 {
        match &self.compressed {
            Some(c) => c.encode(reference),
            None => Uncompressed.encode(reference),
        }
    }

    #[inline]
    fn decode(&self, raw: u64) -> ObjectRef {
        match &self.compressed {
            Some(c) => c.decode(raw),
            None => Uncompressed.decode(raw),
        }
    }

    fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }
}

/// The process-wide reference representation.
#[enum_dispatch(ReferenceCodec)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressingMode {
    Uncompressed,
    Compressed,
    Switchable,
}

impl Default for AddressingMode {
    fn default() -> Self {
        AddressingMode::Compressed(Compressed::default())
    }
}

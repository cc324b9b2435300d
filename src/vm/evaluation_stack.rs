use crate::{
    types::BasicType,
    value::{join_wide, split_wide, AddressingMode, ObjectRef, ReferenceCodec, Slot, Tag, Value},
};

/// A frame's operand stack: slots plus a parallel tag array, addressed from
/// the top. Wide values keep their high word in the deeper position.
pub struct OperandStack {
    slots: Box<[Slot]>,
    tags: Box<[Tag]>,
    top: usize,
    codec: AddressingMode,
}

impl OperandStack {
    pub fn new(capacity: usize, codec: AddressingMode) -> Self {
        Self {
            slots: vec![Slot::ZERO; capacity].into_boxed_slice(),
            tags: vec![Tag::None; capacity].into_boxed_slice(),
            top: 0,
            codec,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn depth(&self) -> usize {
        self.top
    }

    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    #[inline]
    pub fn push(&mut self, n: usize) {
        assert!(
            self.top + n <= self.slots.len(),
            "operand stack overflow: {} + {} > {}",
            self.top,
            n,
            self.slots.len()
        );
        self.top += n;
    }

    #[inline]
    pub fn pop(&mut self, n: usize) {
        assert!(n <= self.top, "operand stack underflow: {} - {}", self.top, n);
        self.top -= n;
    }

    /// Pops `n` slots and clears their tags so no stale reference survives
    /// above the top.
    #[inline]
    pub fn pop_clear_ref(&mut self, n: usize) {
        self.pop(n);
        self.tags[self.top..self.top + n].fill(Tag::None);
    }

    #[inline]
    fn position(&self, offset: usize) -> usize {
        assert!(offset < self.top, "operand stack offset {offset} beyond depth {}", self.top);
        self.top - 1 - offset
    }

    #[inline]
    pub fn pick(&self, offset: usize) -> Slot {
        self.slots[self.position(offset)]
    }

    #[inline]
    pub fn pick_mut(&mut self, offset: usize) -> &mut Slot {
        let p = self.position(offset);
        &mut self.slots[p]
    }

    #[inline]
    pub fn tag(&self, offset: usize) -> Tag {
        self.tags[self.position(offset)]
    }

    #[inline]
    pub fn tag_mut(&mut self, offset: usize) -> &mut Tag {
        let p = self.position(offset);
        &mut self.tags[p]
    }

    /// Reads the wide value whose low word sits at depth `offset`.
    pub fn get_long(&self, offset: usize) -> u64 {
        join_wide(self.pick(offset + 1).half(), self.pick(offset).half())
    }

    pub fn set_long(&mut self, offset: usize, bits: u64) {
        let (high, low) = split_wide(bits);
        *self.pick_mut(offset + 1) = Slot::from_half(high);
        *self.pick_mut(offset) = Slot::from_half(low);
        *self.tag_mut(offset + 1) = Tag::None;
        *self.tag_mut(offset) = Tag::None;
    }

    pub fn clear(&mut self) {
        self.top = 0;
        self.tags.fill(Tag::None);
    }

    /// The top `n` slots and tags, deepest first.
    pub fn window(&self, n: usize) -> (&[Slot], &[Tag]) {
        let base = self.top - n;
        (&self.slots[base..self.top], &self.tags[base..self.top])
    }

    #[inline]
    pub fn push_slot(&mut self, slot: Slot, tag: Tag) {
        self.push(1);
        *self.pick_mut(0) = slot;
        *self.tag_mut(0) = tag;
    }

    #[inline]
    pub fn pop_slot(&mut self) -> (Slot, Tag) {
        let entry = (self.pick(0), self.tag(0));
        self.pop_clear_ref(1);
        entry
    }

    #[inline]
    pub fn push_int(&mut self, value: i32) {
        self.push_slot(Slot::from_int(value), Tag::None);
    }

    #[inline]
    pub fn pop_int(&mut self) -> i32 {
        let v = self.pick(0).as_int();
        self.pop(1);
        v
    }

    #[inline]
    pub fn push_float(&mut self, value: f32) {
        self.push_slot(Slot::from_float(value), Tag::None);
    }

    #[inline]
    pub fn pop_float(&mut self) -> f32 {
        let v = self.pick(0).as_float();
        self.pop(1);
        v
    }

    #[inline]
    pub fn push_long(&mut self, value: i64) {
        self.push(2);
        self.set_long(0, value as u64);
    }

    #[inline]
    pub fn pop_long(&mut self) -> i64 {
        let v = self.get_long(0) as i64;
        self.pop(2);
        v
    }

    #[inline]
    pub fn push_double(&mut self, value: f64) {
        self.push(2);
        self.set_long(0, value.to_bits());
    }

    #[inline]
    pub fn pop_double(&mut self) -> f64 {
        let v = f64::from_bits(self.get_long(0));
        self.pop(2);
        v
    }

    #[inline]
    pub fn push_ref(&mut self, reference: ObjectRef) {
        let raw = self.codec.encode(reference);
        self.push_slot(Slot::from_raw_ref(raw), Tag::Object);
    }

    #[inline]
    pub fn peek_ref(&self, offset: usize) -> ObjectRef {
        self.codec.decode(self.pick(offset).raw_ref())
    }

    #[inline]
    pub fn pop_ref(&mut self) -> ObjectRef {
        let r = self.peek_ref(0);
        self.pop_clear_ref(1);
        r
    }

    pub fn push_return_address(&mut self, pc: usize) {
        self.push_slot(Slot::from_return_address(pc), Tag::ReturnAddress);
    }

    pub fn push_value(&mut self, value: Value) {
        match value {
            Value::Int(i) => self.push_int(i),
            Value::Long(l) => self.push_long(l),
            Value::Float(f) => self.push_float(f),
            Value::Double(d) => self.push_double(d),
            Value::Ref(r) => self.push_ref(r),
        }
    }

    pub fn pop_value(&mut self, ty: BasicType) -> Value {
        match ty {
            BasicType::Long => Value::Long(self.pop_long()),
            BasicType::Float => Value::Float(self.pop_float()),
            BasicType::Double => Value::Double(self.pop_double()),
            BasicType::Reference => Value::Ref(self.pop_ref()),
            BasicType::Void => unreachable!("no value of type void"),
            _ => Value::Int(self.pop_int()),
        }
    }

    /// Reads, without popping, a value of type `ty` whose shallowest slot is
    /// at depth `offset`.
    pub fn peek_value(&self, offset: usize, ty: BasicType) -> Value {
        match ty {
            BasicType::Long => Value::Long(self.get_long(offset) as i64),
            BasicType::Double => Value::Double(f64::from_bits(self.get_long(offset))),
            BasicType::Float => Value::Float(self.pick(offset).as_float()),
            BasicType::Reference => Value::Ref(self.peek_ref(offset)),
            BasicType::Void => unreachable!("no value of type void"),
            _ => Value::Int(self.pick(offset).as_int()),
        }
    }

    /// Live references, from the bottom of the stack.
    pub fn references(&self) -> impl Iterator<Item = (usize, ObjectRef)> + '_ {
        (0..self.top)
            .filter(|&i| self.tags[i] == Tag::Object)
            .map(|i| (i, self.codec.decode(self.slots[i].raw_ref())))
    }

    /// One line per live slot, top first, for stack dumps.
    pub fn describe(&self) -> Vec<String> {
        (0..self.top)
            .rev()
            .map(|i| match self.tags[i] {
                Tag::Object => format!("{:?}", self.codec.decode(self.slots[i].raw_ref())),
                Tag::ReturnAddress => format!("ret {}", self.slots[i].as_return_address()),
                Tag::None => format!("{:?}", self.slots[i]),
            })
            .collect()
    }
}

/// A frame's local variables. Fixed size, indexed from zero, wide values in
/// natural order (low word first).
pub struct Locals {
    slots: Box<[Slot]>,
    tags: Box<[Tag]>,
    codec: AddressingMode,
}

impl Locals {
    pub fn new(size: usize, codec: AddressingMode) -> Self {
        Self {
            slots: vec![Slot::ZERO; size].into_boxed_slice(),
            tags: vec![Tag::None; size].into_boxed_slice(),
            codec,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Slot {
        self.slots[index]
    }

    #[inline]
    pub fn tag(&self, index: usize) -> Tag {
        self.tags[index]
    }

    #[inline]
    pub fn set(&mut self, index: usize, slot: Slot, tag: Tag) {
        self.slots[index] = slot;
        self.tags[index] = tag;
    }

    pub fn get_int(&self, index: usize) -> i32 {
        self.slots[index].as_int()
    }

    pub fn set_int(&mut self, index: usize, value: i32) {
        self.set(index, Slot::from_int(value), Tag::None);
    }

    pub fn get_float(&self, index: usize) -> f32 {
        self.slots[index].as_float()
    }

    pub fn set_float(&mut self, index: usize, value: f32) {
        self.set(index, Slot::from_float(value), Tag::None);
    }

    pub fn get_long(&self, index: usize) -> u64 {
        join_wide(self.slots[index + 1].half(), self.slots[index].half())
    }

    pub fn set_long(&mut self, index: usize, bits: u64) {
        let (high, low) = split_wide(bits);
        self.set(index, Slot::from_half(low), Tag::None);
        self.set(index + 1, Slot::from_half(high), Tag::None);
    }

    pub fn get_ref(&self, index: usize) -> ObjectRef {
        self.codec.decode(self.slots[index].raw_ref())
    }

    pub fn set_ref(&mut self, index: usize, reference: ObjectRef) {
        let raw = self.codec.encode(reference);
        self.set(index, Slot::from_raw_ref(raw), Tag::Object);
    }

    pub fn set_value(&mut self, index: usize, value: Value) {
        match value {
            Value::Int(i) => self.set_int(index, i),
            Value::Long(l) => self.set_long(index, l as u64),
            Value::Float(f) => self.set_float(index, f),
            Value::Double(d) => self.set_long(index, d.to_bits()),
            Value::Ref(r) => self.set_ref(index, r),
        }
    }

    pub fn references(&self) -> impl Iterator<Item = (usize, ObjectRef)> + '_ {
        (0..self.slots.len())
            .filter(|&i| self.tags[i] == Tag::Object)
            .map(|i| (i, self.codec.decode(self.slots[i].raw_ref())))
    }
}

//! A small bytecode assembler for building method bodies by hand.
//!
//! Branch targets are [`Label`]s; forward references are patched when the
//! method is finished.
use crate::{error::AssemblerError, types::BasicType, vm::opcodes::*};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Clone, Copy, Debug)]
struct Fixup {
    /// Where the offset is written.
    at: usize,
    /// The instruction the offset is relative to.
    origin: usize,
    label: Label,
    wide: bool,
}

#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next instruction.
    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    /// A label bound here.
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.bind(label);
        label
    }

    pub fn offset_of(&self, label: Label) -> Option<usize> {
        self.labels[label.0]
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.code.push(opcode);
        self
    }

    pub fn u1(&mut self, value: u8) -> &mut Self {
        self.code.push(value);
        self
    }

    pub fn u2(&mut self, value: u16) -> &mut Self {
        self.code.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn i4(&mut self, value: i32) -> &mut Self {
        self.code.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// An instruction taking a two-byte constant pool index.
    pub fn op_u2(&mut self, opcode: u8, index: u16) -> &mut Self {
        self.op(opcode).u2(index)
    }

    /// The shortest encoding pushing `value`.
    pub fn iconst(&mut self, value: i16) -> &mut Self {
        match value {
            -1..=5 => self.op((ICONST_0 as i16 + value) as u8),
            v if i8::try_from(v).is_ok() => self.op(BIPUSH).u1(v as i8 as u8),
            v => self.op(SIPUSH).u2(v as u16),
        }
    }

    pub fn ldc(&mut self, index: u16) -> &mut Self {
        match u8::try_from(index) {
            Ok(short) => self.op(LDC).u1(short),
            Err(_) => self.op_u2(LDC_W, index),
        }
    }

    pub fn ldc2(&mut self, index: u16) -> &mut Self {
        self.op_u2(LDC2_W, index)
    }

    /// A local load or store, given as one of `iload`..`aload` or
    /// `istore`..`astore`, using the `_n` or `wide` forms where possible.
    pub fn local(&mut self, opcode: u8, index: u16) -> &mut Self {
        let short_base = match opcode {
            ILOAD..=ALOAD => ILOAD_0 + (opcode - ILOAD) * 4,
            ISTORE..=ASTORE => ISTORE_0 + (opcode - ISTORE) * 4,
            other => panic!("{} is not a local load or store", mnemonic(other)),
        };
        match index {
            0..=3 => self.op(short_base + index as u8),
            4..=255 => self.op(opcode).u1(index as u8),
            _ => self.op(WIDE).op(opcode).u2(index),
        }
    }

    pub fn iload(&mut self, index: u16) -> &mut Self {
        self.local(ILOAD, index)
    }

    pub fn lload(&mut self, index: u16) -> &mut Self {
        self.local(LLOAD, index)
    }

    pub fn dload(&mut self, index: u16) -> &mut Self {
        self.local(DLOAD, index)
    }

    pub fn aload(&mut self, index: u16) -> &mut Self {
        self.local(ALOAD, index)
    }

    pub fn istore(&mut self, index: u16) -> &mut Self {
        self.local(ISTORE, index)
    }

    pub fn lstore(&mut self, index: u16) -> &mut Self {
        self.local(LSTORE, index)
    }

    pub fn astore(&mut self, index: u16) -> &mut Self {
        self.local(ASTORE, index)
    }

    pub fn iinc(&mut self, index: u16, delta: i16) -> &mut Self {
        match (u8::try_from(index), i8::try_from(delta)) {
            (Ok(index), Ok(delta)) => self.op(IINC).u1(index).u1(delta as u8),
            _ => self.op(WIDE).op(IINC).u2(index).u2(delta as u16),
        }
    }

    /// A branch to `target`. `goto_w` and `jsr_w` get four-byte offsets;
    /// every other branch two.
    pub fn branch(&mut self, opcode: u8, target: Label) -> &mut Self {
        let origin = self.pc();
        let wide = matches!(opcode, GOTO_W | JSR_W);
        self.op(opcode);
        self.offset(origin, target, wide)
    }

    fn offset(&mut self, origin: usize, label: Label, wide: bool) -> &mut Self {
        self.fixups.push(Fixup {
            at: self.pc(),
            origin,
            label,
            wide,
        });
        if wide {
            self.i4(0)
        } else {
            self.u2(0)
        }
    }

    fn pad_switch(&mut self, origin: usize) {
        for _ in 0..switch_padding(origin) {
            self.code.push(0);
        }
    }

    /// `tableswitch` over `low..low + targets.len()`.
    pub fn tableswitch(&mut self, default: Label, low: i32, targets: &[Label]) -> &mut Self {
        let origin = self.pc();
        self.op(TABLESWITCH);
        self.pad_switch(origin);
        self.offset(origin, default, true);
        self.i4(low).i4(low + targets.len() as i32 - 1);
        for target in targets {
            self.offset(origin, *target, true);
        }
        self
    }

    /// `lookupswitch`; the pairs are sorted by key as the encoding requires.
    pub fn lookupswitch(&mut self, default: Label, pairs: &[(i32, Label)]) -> &mut Self {
        let mut pairs = pairs.to_vec();
        pairs.sort_by_key(|(key, _)| *key);

        let origin = self.pc();
        self.op(LOOKUPSWITCH);
        self.pad_switch(origin);
        self.offset(origin, default, true);
        self.i4(pairs.len() as i32);
        for (key, target) in pairs {
            self.i4(key);
            self.offset(origin, target, true);
        }
        self
    }

    pub fn invoke(&mut self, opcode: u8, index: u16) -> &mut Self {
        self.op_u2(opcode, index)
    }

    pub fn invokeinterface(&mut self, index: u16, argument_slots: u8) -> &mut Self {
        self.op_u2(INVOKEINTERFACE, index).u1(argument_slots).u1(0)
    }

    pub fn newarray(&mut self, element: BasicType) -> &mut Self {
        let Some(code) = element.array_type_code() else {
            panic!("no primitive array of {element:?}");
        };
        self.op(NEWARRAY).u1(code)
    }

    pub fn multianewarray(&mut self, index: u16, dimensions: u8) -> &mut Self {
        self.op_u2(MULTIANEWARRAY, index).u1(dimensions)
    }

    /// Resolves every branch and returns the finished bytecode.
    pub fn finish(mut self) -> Result<Vec<u8>, AssemblerError> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0].ok_or(AssemblerError::UnboundLabel(fixup.label.0))?;
            let offset = target as i64 - fixup.origin as i64;
            if fixup.wide {
                self.code[fixup.at..fixup.at + 4].copy_from_slice(&(offset as i32).to_be_bytes());
            } else {
                let short = i16::try_from(offset).map_err(|_| AssemblerError::BranchTooFar {
                    from: fixup.origin,
                    to: target,
                })?;
                self.code[fixup.at..fixup.at + 2].copy_from_slice(&short.to_be_bytes());
            }
        }
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_pick_shortest_form() {
        let mut a = Assembler::new();
        a.iconst(-1).iconst(5).iconst(100).iconst(-129).iconst(1000);
        assert_eq!(
            a.finish().unwrap(),
            vec![ICONST_M1, ICONST_5, BIPUSH, 100, SIPUSH, 0xff, 0x7f, SIPUSH, 0x03, 0xe8]
        );
    }

    #[test]
    fn test_local_forms() {
        let mut a = Assembler::new();
        a.iload(2).astore(0).lload(7).istore(300).iinc(1, 5).iinc(1, 1000);
        assert_eq!(
            a.finish().unwrap(),
            vec![
                ILOAD_2, ASTORE_0, LLOAD, 7, WIDE, ISTORE, 0x01, 0x2c, IINC, 1, 5, WIDE, IINC, 0,
                1, 0x03, 0xe8
            ]
        );
    }

    #[test]
    fn test_forward_and_backward_branches() {
        let mut a = Assembler::new();
        let top = a.here();
        let end = a.label();
        a.iload(0).branch(IFEQ, end).iinc(0, -1).branch(GOTO, top);
        a.bind(end).op(RETURN);
        let code = a.finish().unwrap();
        assert_eq!(&code[1..4], &[IFEQ, 0, 9]);
        assert_eq!(&code[7..10], &[GOTO, 0xff, 0xf9]);
        assert_eq!(code[10], RETURN);
    }

    #[test]
    fn test_switch_padding_and_lengths() {
        let mut a = Assembler::new();
        a.op(NOP);
        let (zero, one, default) = (a.label(), a.label(), a.label());
        a.tableswitch(default, 0, &[zero, one]);
        let after_table = a.pc();
        a.lookupswitch(default, &[(10, one), (-3, zero)]);
        a.bind(zero).bind(one).bind(default).op(RETURN);
        let code = a.finish().unwrap();

        assert_eq!(instruction_length(&code, 1), Some(after_table - 1));
        assert_eq!(after_table, 1 + 1 + 2 + 12 + 8);
        // keys come out sorted
        let pairs = after_table + 1 + switch_padding(after_table) + 8;
        assert_eq!(read_i32(&code, pairs), -3);
        assert_eq!(read_i32(&code, pairs + 8), 10);
    }

    #[test]
    fn test_unbound_label_is_reported() {
        let mut a = Assembler::new();
        let nowhere = a.label();
        a.branch(GOTO, nowhere);
        assert_eq!(a.finish(), Err(AssemblerError::UnboundLabel(0)));
    }

    #[test]
    fn test_short_branch_range() {
        let mut a = Assembler::new();
        let far = a.label();
        a.branch(GOTO, far);
        for _ in 0..40_000 {
            a.op(NOP);
        }
        a.bind(far).op(RETURN);
        assert_eq!(
            a.finish(),
            Err(AssemblerError::BranchTooFar { from: 0, to: 40_003 })
        );

        let mut a = Assembler::new();
        let far = a.label();
        a.branch(GOTO_W, far);
        for _ in 0..40_000 {
            a.op(NOP);
        }
        a.bind(far).op(RETURN);
        let code = a.finish().unwrap();
        assert_eq!(read_i32(&code, 1), 40_005);
    }
}

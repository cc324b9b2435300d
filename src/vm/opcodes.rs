//! The instruction set: opcode values, mnemonics and encoded lengths.

macro_rules! opcodes {
    ($($name:ident = $code:literal ($len:literal)),+ $(,)?) => {
        $(pub const $name: u8 = $code;)+

        pub fn mnemonic(opcode: u8) -> &'static str {
            match opcode {
                $($code => stringify!($name),)+
                _ => "<undefined>",
            }
        }

        // zero marks variable-length and undefined opcodes
        const LENGTHS: [u8; 256] = {
            let mut table = [0u8; 256];
            $(table[$code as usize] = $len;)+
            table
        };
    };
}

opcodes! {
    NOP = 0x00 (1),
    ACONST_NULL = 0x01 (1),
    ICONST_M1 = 0x02 (1),
    ICONST_0 = 0x03 (1),
    ICONST_1 = 0x04 (1),
    ICONST_2 = 0x05 (1),
    ICONST_3 = 0x06 (1),
    ICONST_4 = 0x07 (1),
    ICONST_5 = 0x08 (1),
    LCONST_0 = 0x09 (1),
    LCONST_1 = 0x0a (1),
    FCONST_0 = 0x0b (1),
    FCONST_1 = 0x0c (1),
    FCONST_2 = 0x0d (1),
    DCONST_0 = 0x0e (1),
    DCONST_1 = 0x0f (1),
    BIPUSH = 0x10 (2),
    SIPUSH = 0x11 (3),
    LDC = 0x12 (2),
    LDC_W = 0x13 (3),
    LDC2_W = 0x14 (3),
    ILOAD = 0x15 (2),
    LLOAD = 0x16 (2),
    FLOAD = 0x17 (2),
    DLOAD = 0x18 (2),
    ALOAD = 0x19 (2),
    ILOAD_0 = 0x1a (1),
    ILOAD_1 = 0x1b (1),
    ILOAD_2 = 0x1c (1),
    ILOAD_3 = 0x1d (1),
    LLOAD_0 = 0x1e (1),
    LLOAD_1 = 0x1f (1),
    LLOAD_2 = 0x20 (1),
    LLOAD_3 = 0x21 (1),
    FLOAD_0 = 0x22 (1),
    FLOAD_1 = 0x23 (1),
    FLOAD_2 = 0x24 (1),
    FLOAD_3 = 0x25 (1),
    DLOAD_0 = 0x26 (1),
    DLOAD_1 = 0x27 (1),
    DLOAD_2 = 0x28 (1),
    DLOAD_3 = 0x29 (1),
    ALOAD_0 = 0x2a (1),
    ALOAD_1 = 0x2b (1),
    ALOAD_2 = 0x2c (1),
    ALOAD_3 = 0x2d (1),
    IALOAD = 0x2e (1),
    LALOAD = 0x2f (1),
    FALOAD = 0x30 (1),
    DALOAD = 0x31 (1),
    AALOAD = 0x32 (1),
    BALOAD = 0x33 (1),
    CALOAD = 0x34 (1),
    SALOAD = 0x35 (1),
    ISTORE = 0x36 (2),
    LSTORE = 0x37 (2),
    FSTORE = 0x38 (2),
    DSTORE = 0x39 (2),
    ASTORE = 0x3a (2),
    ISTORE_0 = 0x3b (1),
    ISTORE_1 = 0x3c (1),
    ISTORE_2 = 0x3d (1),
    ISTORE_3 = 0x3e (1),
    LSTORE_0 = 0x3f (1),
    LSTORE_1 = 0x40 (1),
    LSTORE_2 = 0x41 (1),
    LSTORE_3 = 0x42 (1),
    FSTORE_0 = 0x43 (1),
    FSTORE_1 = 0x44 (1),
    FSTORE_2 = 0x45 (1),
    FSTORE_3 = 0x46 (1),
    DSTORE_0 = 0x47 (1),
    DSTORE_1 = 0x48 (1),
    DSTORE_2 = 0x49 (1),
    DSTORE_3 = 0x4a (1),
    ASTORE_0 = 0x4b (1),
    ASTORE_1 = 0x4c (1),
    ASTORE_2 = 0x4d (1),
    ASTORE_3 = 0x4e (1),
    IASTORE = 0x4f (1),
    LASTORE = 0x50 (1),
    FASTORE = 0x51 (1),
    DASTORE = 0x52 (1),
    AASTORE = 0x53 (1),
    BASTORE = 0x54 (1),
    CASTORE = 0x55 (1),
    SASTORE = 0x56 (1),
    POP = 0x57 (1),
    POP2 = 0x58 (1),
    DUP = 0x59 (1),
    DUP_X1 = 0x5a (1),
    DUP_X2 = 0x5b (1),
    DUP2 = 0x5c (1),
    DUP2_X1 = 0x5d (1),
    DUP2_X2 = 0x5e (1),
    SWAP = 0x5f (1),
    IADD = 0x60 (1),
    LADD = 0x61 (1),
    FADD = 0x62 (1),
    DADD = 0x63 (1),
    ISUB = 0x64 (1),
    LSUB = 0x65 (1),
    FSUB = 0x66 (1),
    DSUB = 0x67 (1),
    IMUL = 0x68 (1),
    LMUL = 0x69 (1),
    FMUL = 0x6a (1),
    DMUL = 0x6b (1),
    IDIV = 0x6c (1),
    LDIV = 0x6d (1),
    FDIV = 0x6e (1),
    DDIV = 0x6f (1),
    IREM = 0x70 (1),
    LREM = 0x71 (1),
    FREM = 0x72 (1),
    DREM = 0x73 (1),
    INEG = 0x74 (1),
    LNEG = 0x75 (1),
    FNEG = 0x76 (1),
    DNEG = 0x77 (1),
    ISHL = 0x78 (1),
    LSHL = 0x79 (1),
    ISHR = 0x7a (1),
    LSHR = 0x7b (1),
    IUSHR = 0x7c (1),
    LUSHR = 0x7d (1),
    IAND = 0x7e (1),
    LAND = 0x7f (1),
    IOR = 0x80 (1),
    LOR = 0x81 (1),
    IXOR = 0x82 (1),
    LXOR = 0x83 (1),
    IINC = 0x84 (3),
    I2L = 0x85 (1),
    I2F = 0x86 (1),
    I2D = 0x87 (1),
    L2I = 0x88 (1),
    L2F = 0x89 (1),
    L2D = 0x8a (1),
    F2I = 0x8b (1),
    F2L = 0x8c (1),
    F2D = 0x8d (1),
    D2I = 0x8e (1),
    D2L = 0x8f (1),
    D2F = 0x90 (1),
    I2B = 0x91 (1),
    I2C = 0x92 (1),
    I2S = 0x93 (1),
    LCMP = 0x94 (1),
    FCMPL = 0x95 (1),
    FCMPG = 0x96 (1),
    DCMPL = 0x97 (1),
    DCMPG = 0x98 (1),
    IFEQ = 0x99 (3),
    IFNE = 0x9a (3),
    IFLT = 0x9b (3),
    IFGE = 0x9c (3),
    IFGT = 0x9d (3),
    IFLE = 0x9e (3),
    IF_ICMPEQ = 0x9f (3),
    IF_ICMPNE = 0xa0 (3),
    IF_ICMPLT = 0xa1 (3),
    IF_ICMPGE = 0xa2 (3),
    IF_ICMPGT = 0xa3 (3),
    IF_ICMPLE = 0xa4 (3),
    IF_ACMPEQ = 0xa5 (3),
    IF_ACMPNE = 0xa6 (3),
    GOTO = 0xa7 (3),
    JSR = 0xa8 (3),
    RET = 0xa9 (2),
    TABLESWITCH = 0xaa (0),
    LOOKUPSWITCH = 0xab (0),
    IRETURN = 0xac (1),
    LRETURN = 0xad (1),
    FRETURN = 0xae (1),
    DRETURN = 0xaf (1),
    ARETURN = 0xb0 (1),
    RETURN = 0xb1 (1),
    GETSTATIC = 0xb2 (3),
    PUTSTATIC = 0xb3 (3),
    GETFIELD = 0xb4 (3),
    PUTFIELD = 0xb5 (3),
    INVOKEVIRTUAL = 0xb6 (3),
    INVOKESPECIAL = 0xb7 (3),
    INVOKESTATIC = 0xb8 (3),
    INVOKEINTERFACE = 0xb9 (5),
    INVOKEDYNAMIC = 0xba (5),
    NEW = 0xbb (3),
    NEWARRAY = 0xbc (2),
    ANEWARRAY = 0xbd (3),
    ARRAYLENGTH = 0xbe (1),
    ATHROW = 0xbf (1),
    CHECKCAST = 0xc0 (3),
    INSTANCEOF = 0xc1 (3),
    MONITORENTER = 0xc2 (1),
    MONITOREXIT = 0xc3 (1),
    WIDE = 0xc4 (0),
    MULTIANEWARRAY = 0xc5 (4),
    IFNULL = 0xc6 (3),
    IFNONNULL = 0xc7 (3),
    GOTO_W = 0xc8 (5),
    JSR_W = 0xc9 (5),
    BREAKPOINT = 0xca (1),
}

/// Bytes between a switch opcode at `pc` and its 4-byte aligned operands.
pub fn switch_padding(pc: usize) -> usize {
    (4 - (pc + 1) % 4) % 4
}

pub(crate) fn read_i32(code: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

/// Encoded length of the instruction at `pc`, operands included. `None`
/// for undefined opcodes and truncated code.
pub fn instruction_length(code: &[u8], pc: usize) -> Option<usize> {
    let opcode = *code.get(pc)?;
    let length = match opcode {
        TABLESWITCH => {
            let base = pc + 1 + switch_padding(pc);
            if base + 12 > code.len() {
                return None;
            }
            let low = read_i32(code, base + 4) as i64;
            let high = read_i32(code, base + 8) as i64;
            if high < low {
                return None;
            }
            base + 12 + 4 * (high - low + 1) as usize - pc
        }
        LOOKUPSWITCH => {
            let base = pc + 1 + switch_padding(pc);
            if base + 8 > code.len() {
                return None;
            }
            let pairs = read_i32(code, base + 4);
            if pairs < 0 {
                return None;
            }
            base + 8 + 8 * pairs as usize - pc
        }
        WIDE => match *code.get(pc + 1)? {
            IINC => 6,
            ILOAD | LLOAD | FLOAD | DLOAD | ALOAD | ISTORE | LSTORE | FSTORE | DSTORE
            | ASTORE | RET => 4,
            _ => return None,
        },
        op => match LENGTHS[op as usize] {
            0 => return None,
            n => n as usize,
        },
    };
    (pc + length <= code.len()).then_some(length)
}

/// Splits `code` into `(pc, mnemonic)` pairs. Stops at the first
/// undecodable instruction.
pub fn disassemble(code: &[u8]) -> Vec<(usize, &'static str)> {
    let mut out = vec![];
    let mut pc = 0;
    while let Some(length) = instruction_length(code, pc) {
        out.push((pc, mnemonic(code[pc])));
        pc += length;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_lengths() {
        assert_eq!(instruction_length(&[IADD], 0), Some(1));
        assert_eq!(instruction_length(&[SIPUSH, 0, 1], 0), Some(3));
        assert_eq!(instruction_length(&[INVOKEINTERFACE, 0, 1, 1, 0], 0), Some(5));
        assert_eq!(instruction_length(&[SIPUSH, 0], 0), None);
        assert_eq!(instruction_length(&[0xfe], 0), None);
        assert_eq!(mnemonic(MONITORENTER), "MONITORENTER");
    }

    #[test]
    fn test_wide_lengths() {
        assert_eq!(instruction_length(&[WIDE, ILOAD, 1, 0], 0), Some(4));
        assert_eq!(instruction_length(&[WIDE, IINC, 1, 0, 0, 5], 0), Some(6));
        assert_eq!(instruction_length(&[WIDE, IADD, 0, 0], 0), None);
    }

    #[test]
    fn test_switch_lengths_include_padding() {
        // pc 1: two padding bytes, then default, low=0, high=1, two offsets
        let mut code = vec![NOP, TABLESWITCH, 0, 0];
        for word in [20i32, 0, 1, 10, 12] {
            code.extend(word.to_be_bytes());
        }
        assert_eq!(switch_padding(1), 2);
        assert_eq!(instruction_length(&code, 1), Some(3 + 20));

        let mut code = vec![LOOKUPSWITCH, 0, 0, 0];
        for word in [9i32, 2, 1, 5, 7, 6] {
            code.extend(word.to_be_bytes());
        }
        assert_eq!(instruction_length(&code, 0), Some(4 + 24));
    }

    #[test]
    fn test_disassemble() {
        let code = [ICONST_5, ICONST_3, ISUB, IRETURN];
        assert_eq!(
            disassemble(&code),
            vec![(0, "ICONST_5"), (1, "ICONST_3"), (2, "ISUB"), (3, "IRETURN")]
        );
    }
}

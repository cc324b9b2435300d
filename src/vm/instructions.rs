use crate::{
    resolve::Constant,
    types::{ArrayElement, BasicType, FieldDescription, WellKnown},
    value::{ObjectRef, Slot, Tag, Value},
    vm::{
        calls::InvokeKind,
        opcodes::{self, *},
        CallStack, EventMask, Location, StepResult,
    },
};
use std::{cmp::Ordering, sync::Arc};

/// Copies the top `count` slots of `stack` below the `depth` slots under
/// them, as the `dup` family does.
fn dup_insert(stack: &mut crate::vm::OperandStack, count: usize, depth: usize) {
    let total = count + depth;
    let mut items = [(Slot::ZERO, Tag::None); 4];
    for (i, item) in items[..total].iter_mut().enumerate() {
        let offset = total - 1 - i;
        *item = (stack.pick(offset), stack.tag(offset));
    }
    stack.pop(total);
    let (skipped, copied) = items[..total].split_at(depth);
    for &(slot, tag) in copied.iter().chain(skipped).chain(copied) {
        stack.push_slot(slot, tag);
    }
}

fn compare_floats<T: PartialOrd>(a: T, b: T, nan: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Greater) => 1,
        None => nan,
    }
}

impl CallStack {
    /// Executes one instruction of the top frame.
    pub(crate) fn step(&mut self) -> StepResult {
        let top = self.frames.len() - 1;
        let runtime = self.runtime.clone();
        let events = runtime.config.events;
        let thread = self.thread_id();

        if !events.is_empty() {
            if self.poll_frame_pop() {
                return StepResult::Popped;
            }
            if events.contains(EventMask::SINGLE_STEP) {
                if let Some(hooks) = &runtime.hooks {
                    hooks.single_step(thread, &self.frames[top]);
                }
                if self.poll_frame_pop() {
                    return StepResult::Popped;
                }
            }
        }

        let method = self.frames[top].method.clone();
        let Some(code) = method.code.as_ref() else {
            self.fatal("interpreted frame without bytecode");
        };
        let bytecode = &code.bytecode[..];
        let pc = self.frames[top].pc;
        let Some(&fetched) = bytecode.get(pc) else {
            self.fatal(&format!("pc {pc} ran off the end of {method:?}"));
        };

        // a breakpoint executes the instruction it replaced
        let opcode = if fetched == BREAKPOINT {
            let original = if events.contains(EventMask::BREAKPOINT) {
                runtime
                    .hooks
                    .as_ref()
                    .and_then(|h| h.breakpoint(thread, &self.frames[top]))
            } else {
                None
            };
            match original {
                Some(op) if op != BREAKPOINT => op,
                _ => self.fatal(&format!("unserviced breakpoint at {method:?} @ {pc}")),
            }
        } else {
            fetched
        };

        vm_trace_instruction!(self, pc, opcodes::mnemonic(opcode));
        let container = method.class;

        macro_rules! frame {
            () => {
                self.frames[top]
            };
        }
        macro_rules! stack {
            () => {
                self.frames[top].stack
            };
        }
        macro_rules! locals {
            () => {
                self.frames[top].locals
            };
        }
        macro_rules! u1 {
            ($at:expr) => {
                bytecode[pc + $at]
            };
        }
        macro_rules! u2 {
            ($at:expr) => {
                u16::from_be_bytes([bytecode[pc + $at], bytecode[pc + $at + 1]])
            };
        }
        macro_rules! i2 {
            ($at:expr) => {
                u2!($at) as i16
            };
        }
        macro_rules! i4 {
            ($at:expr) => {
                opcodes::read_i32(bytecode, pc + $at)
            };
        }
        macro_rules! next {
            ($len:expr) => {{
                frame!().pc = pc + $len;
                StepResult::Continue
            }};
        }
        macro_rules! push {
            ($kind:ident, $val:expr) => {{
                let v = $val;
                stack!().$kind(v);
            }};
        }
        macro_rules! pop {
            ($kind:ident) => {
                stack!().$kind()
            };
        }
        macro_rules! unary_op {
            ($pop:ident => $push:ident, |$a:ident| $body:expr) => {{
                let $a = pop!($pop);
                push!($push, $body);
                next!(1)
            }};
        }
        macro_rules! binary_arith_op {
            ($pop:ident => $push:ident, |$a:ident, $b:ident| $body:expr) => {{
                let $b = pop!($pop);
                let $a = pop!($pop);
                push!($push, $body);
                next!(1)
            }};
        }
        macro_rules! shift_op {
            ($pop:ident => $push:ident, |$a:ident, $s:ident| $body:expr) => {{
                let $s = pop!(pop_int) as u32;
                let $a = pop!($pop);
                push!($push, $body);
                next!(1)
            }};
        }
        macro_rules! division_op {
            ($pop:ident => $push:ident, $method:ident) => {{
                let b = pop!($pop);
                let a = pop!($pop);
                if b == 0 {
                    return self.raise(WellKnown::ArithmeticException, Some("/ by zero".into()));
                }
                push!($push, a.$method(b));
                next!(1)
            }};
        }
        macro_rules! branch {
            ($offset:expr, $len:expr, $taken:expr, $conditional:expr) => {{
                let offset = $offset as isize;
                let taken = $taken;
                let target = if taken {
                    (pc as isize + offset) as usize
                } else {
                    pc + $len
                };
                vm_trace_branch!(self, opcodes::mnemonic(opcode), target, taken);
                frame!().pc = target;
                if $conditional || offset <= 0 {
                    self.safepoint();
                }
                StepResult::Continue
            }};
        }
        macro_rules! if_int {
            (|$v:ident| $cond:expr) => {{
                let $v = pop!(pop_int);
                branch!(i2!(1), 3, $cond, true)
            }};
        }
        macro_rules! if_int_cmp {
            (|$a:ident, $b:ident| $cond:expr) => {{
                let $b = pop!(pop_int);
                let $a = pop!(pop_int);
                branch!(i2!(1), 3, $cond, true)
            }};
        }
        macro_rules! load {
            ($index:expr, $wide:expr, $len:expr) => {{
                frame!().load_local($index as usize, $wide);
                next!($len)
            }};
        }
        macro_rules! store {
            ($index:expr, $wide:expr, $len:expr) => {{
                frame!().store_local($index as usize, $wide);
                next!($len)
            }};
        }
        macro_rules! non_null {
            ($obj:expr, $what:expr) => {{
                let obj = $obj;
                if obj.is_null() {
                    return self.raise(WellKnown::NullPointerException, Some($what.into()));
                }
                obj
            }};
        }
        macro_rules! resolved {
            ($method:ident($index:expr)) => {{
                let index = $index;
                match self.resolving(|r| r.$method(container, index)) {
                    Ok(v) => v,
                    Err(e) => return self.raise_resolution(e),
                }
            }};
        }
        macro_rules! array_load {
            () => {{
                let index = pop!(pop_int);
                let array = non_null!(pop!(pop_ref), "Cannot load from a null array");
                match self.array_element(array, index) {
                    Ok(v) => {
                        stack!().push_value(v);
                        next!(1)
                    }
                    Err(result) => result,
                }
            }};
        }
        macro_rules! array_store {
            ($ty:expr) => {{
                let value = stack!().pop_value($ty);
                let index = pop!(pop_int);
                let array = non_null!(pop!(pop_ref), "Cannot store to a null array");
                if let Err(result) = self.store_element(array, index, value) {
                    return result;
                }
                next!(1)
            }};
        }

        match opcode {
            NOP => next!(1),
            ACONST_NULL => {
                push!(push_ref, ObjectRef::NULL);
                next!(1)
            }
            ICONST_M1..=ICONST_5 => {
                push!(push_int, opcode as i32 - ICONST_0 as i32);
                next!(1)
            }
            LCONST_0 | LCONST_1 => {
                push!(push_long, (opcode - LCONST_0) as i64);
                next!(1)
            }
            FCONST_0..=FCONST_2 => {
                push!(push_float, (opcode - FCONST_0) as f32);
                next!(1)
            }
            DCONST_0 | DCONST_1 => {
                push!(push_double, (opcode - DCONST_0) as f64);
                next!(1)
            }
            BIPUSH => {
                push!(push_int, u1!(1) as i8 as i32);
                next!(2)
            }
            SIPUSH => {
                push!(push_int, i2!(1) as i32);
                next!(3)
            }
            LDC | LDC_W | LDC2_W => {
                let (index, length) = if opcode == LDC {
                    (u1!(1) as u16, 2)
                } else {
                    (u2!(1), 3)
                };
                let constant = resolved!(resolve_constant(index));
                match constant {
                    Constant::Int(i) => push!(push_int, i),
                    Constant::Float(f) => push!(push_float, f),
                    Constant::Long(l) => push!(push_long, l),
                    Constant::Double(d) => push!(push_double, d),
                    Constant::String(s) => {
                        let class = runtime.resolver.well_known(WellKnown::String);
                        push!(push_ref, runtime.heap.intern(&s, class))
                    }
                    Constant::Class(c) => {
                        let class = runtime.resolver.well_known(WellKnown::Class);
                        push!(push_ref, runtime.heap.mirror(c, class))
                    }
                }
                next!(length)
            }

            ILOAD | FLOAD | ALOAD => load!(u1!(1), false, 2),
            LLOAD | DLOAD => load!(u1!(1), true, 2),
            ILOAD_0..=ILOAD_3 => load!(opcode - ILOAD_0, false, 1),
            LLOAD_0..=LLOAD_3 => load!(opcode - LLOAD_0, true, 1),
            FLOAD_0..=FLOAD_3 => load!(opcode - FLOAD_0, false, 1),
            DLOAD_0..=DLOAD_3 => load!(opcode - DLOAD_0, true, 1),
            ALOAD_0..=ALOAD_3 => load!(opcode - ALOAD_0, false, 1),
            ISTORE | FSTORE | ASTORE => store!(u1!(1), false, 2),
            LSTORE | DSTORE => store!(u1!(1), true, 2),
            ISTORE_0..=ISTORE_3 => store!(opcode - ISTORE_0, false, 1),
            LSTORE_0..=LSTORE_3 => store!(opcode - LSTORE_0, true, 1),
            FSTORE_0..=FSTORE_3 => store!(opcode - FSTORE_0, false, 1),
            DSTORE_0..=DSTORE_3 => store!(opcode - DSTORE_0, true, 1),
            ASTORE_0..=ASTORE_3 => store!(opcode - ASTORE_0, false, 1),

            IALOAD | LALOAD | FALOAD | DALOAD | AALOAD | BALOAD | CALOAD | SALOAD => {
                array_load!()
            }
            IASTORE | BASTORE | CASTORE | SASTORE => array_store!(BasicType::Int),
            LASTORE => array_store!(BasicType::Long),
            FASTORE => array_store!(BasicType::Float),
            DASTORE => array_store!(BasicType::Double),
            AASTORE => array_store!(BasicType::Reference),

            POP => {
                stack!().pop_clear_ref(1);
                next!(1)
            }
            POP2 => {
                stack!().pop_clear_ref(2);
                next!(1)
            }
            DUP => {
                dup_insert(&mut stack!(), 1, 0);
                next!(1)
            }
            DUP_X1 => {
                dup_insert(&mut stack!(), 1, 1);
                next!(1)
            }
            DUP_X2 => {
                dup_insert(&mut stack!(), 1, 2);
                next!(1)
            }
            DUP2 => {
                dup_insert(&mut stack!(), 2, 0);
                next!(1)
            }
            DUP2_X1 => {
                dup_insert(&mut stack!(), 2, 1);
                next!(1)
            }
            DUP2_X2 => {
                dup_insert(&mut stack!(), 2, 2);
                next!(1)
            }
            SWAP => {
                let (a, b) = (stack!().pop_slot(), stack!().pop_slot());
                stack!().push_slot(a.0, a.1);
                stack!().push_slot(b.0, b.1);
                next!(1)
            }

            IADD => binary_arith_op!(pop_int => push_int, |a, b| a.wrapping_add(b)),
            LADD => binary_arith_op!(pop_long => push_long, |a, b| a.wrapping_add(b)),
            FADD => binary_arith_op!(pop_float => push_float, |a, b| a + b),
            DADD => binary_arith_op!(pop_double => push_double, |a, b| a + b),
            ISUB => binary_arith_op!(pop_int => push_int, |a, b| a.wrapping_sub(b)),
            LSUB => binary_arith_op!(pop_long => push_long, |a, b| a.wrapping_sub(b)),
            FSUB => binary_arith_op!(pop_float => push_float, |a, b| a - b),
            DSUB => binary_arith_op!(pop_double => push_double, |a, b| a - b),
            IMUL => binary_arith_op!(pop_int => push_int, |a, b| a.wrapping_mul(b)),
            LMUL => binary_arith_op!(pop_long => push_long, |a, b| a.wrapping_mul(b)),
            FMUL => binary_arith_op!(pop_float => push_float, |a, b| a * b),
            DMUL => binary_arith_op!(pop_double => push_double, |a, b| a * b),
            IDIV => division_op!(pop_int => push_int, wrapping_div),
            LDIV => division_op!(pop_long => push_long, wrapping_div),
            FDIV => binary_arith_op!(pop_float => push_float, |a, b| a / b),
            DDIV => binary_arith_op!(pop_double => push_double, |a, b| a / b),
            IREM => division_op!(pop_int => push_int, wrapping_rem),
            LREM => division_op!(pop_long => push_long, wrapping_rem),
            FREM => binary_arith_op!(pop_float => push_float, |a, b| a % b),
            DREM => binary_arith_op!(pop_double => push_double, |a, b| a % b),
            INEG => unary_op!(pop_int => push_int, |a| a.wrapping_neg()),
            LNEG => unary_op!(pop_long => push_long, |a| a.wrapping_neg()),
            FNEG => unary_op!(pop_float => push_float, |a| -a),
            DNEG => unary_op!(pop_double => push_double, |a| -a),
            ISHL => shift_op!(pop_int => push_int, |a, s| a.wrapping_shl(s)),
            LSHL => shift_op!(pop_long => push_long, |a, s| a.wrapping_shl(s)),
            ISHR => shift_op!(pop_int => push_int, |a, s| a.wrapping_shr(s)),
            LSHR => shift_op!(pop_long => push_long, |a, s| a.wrapping_shr(s)),
            IUSHR => shift_op!(pop_int => push_int, |a, s| (a as u32).wrapping_shr(s) as i32),
            LUSHR => shift_op!(pop_long => push_long, |a, s| (a as u64).wrapping_shr(s) as i64),
            IAND => binary_arith_op!(pop_int => push_int, |a, b| a & b),
            LAND => binary_arith_op!(pop_long => push_long, |a, b| a & b),
            IOR => binary_arith_op!(pop_int => push_int, |a, b| a | b),
            LOR => binary_arith_op!(pop_long => push_long, |a, b| a | b),
            IXOR => binary_arith_op!(pop_int => push_int, |a, b| a ^ b),
            LXOR => binary_arith_op!(pop_long => push_long, |a, b| a ^ b),
            IINC => {
                let index = u1!(1) as usize;
                let value = locals!().get_int(index).wrapping_add(u1!(2) as i8 as i32);
                locals!().set_int(index, value);
                next!(3)
            }

            // float to integer conversions saturate and send NaN to zero
            I2L => unary_op!(pop_int => push_long, |a| a as i64),
            I2F => unary_op!(pop_int => push_float, |a| a as f32),
            I2D => unary_op!(pop_int => push_double, |a| a as f64),
            L2I => unary_op!(pop_long => push_int, |a| a as i32),
            L2F => unary_op!(pop_long => push_float, |a| a as f32),
            L2D => unary_op!(pop_long => push_double, |a| a as f64),
            F2I => unary_op!(pop_float => push_int, |a| a as i32),
            F2L => unary_op!(pop_float => push_long, |a| a as i64),
            F2D => unary_op!(pop_float => push_double, |a| a as f64),
            D2I => unary_op!(pop_double => push_int, |a| a as i32),
            D2L => unary_op!(pop_double => push_long, |a| a as i64),
            D2F => unary_op!(pop_double => push_float, |a| a as f32),
            I2B => unary_op!(pop_int => push_int, |a| a as i8 as i32),
            I2C => unary_op!(pop_int => push_int, |a| a as u16 as i32),
            I2S => unary_op!(pop_int => push_int, |a| a as i16 as i32),

            LCMP => binary_arith_op!(pop_long => push_int, |a, b| a.cmp(&b) as i32),
            FCMPL => binary_arith_op!(pop_float => push_int, |a, b| compare_floats(a, b, -1)),
            FCMPG => binary_arith_op!(pop_float => push_int, |a, b| compare_floats(a, b, 1)),
            DCMPL => binary_arith_op!(pop_double => push_int, |a, b| compare_floats(a, b, -1)),
            DCMPG => binary_arith_op!(pop_double => push_int, |a, b| compare_floats(a, b, 1)),

            IFEQ => if_int!(|v| v == 0),
            IFNE => if_int!(|v| v != 0),
            IFLT => if_int!(|v| v < 0),
            IFGE => if_int!(|v| v >= 0),
            IFGT => if_int!(|v| v > 0),
            IFLE => if_int!(|v| v <= 0),
            IF_ICMPEQ => if_int_cmp!(|a, b| a == b),
            IF_ICMPNE => if_int_cmp!(|a, b| a != b),
            IF_ICMPLT => if_int_cmp!(|a, b| a < b),
            IF_ICMPGE => if_int_cmp!(|a, b| a >= b),
            IF_ICMPGT => if_int_cmp!(|a, b| a > b),
            IF_ICMPLE => if_int_cmp!(|a, b| a <= b),
            IF_ACMPEQ | IF_ACMPNE => {
                let b = pop!(pop_ref);
                let a = pop!(pop_ref);
                branch!(i2!(1), 3, (a == b) == (opcode == IF_ACMPEQ), true)
            }
            IFNULL | IFNONNULL => {
                let v = pop!(pop_ref);
                branch!(i2!(1), 3, v.is_null() == (opcode == IFNULL), true)
            }
            GOTO => branch!(i2!(1), 3, true, false),
            GOTO_W => branch!(i4!(1), 5, true, false),
            JSR | JSR_W => {
                let (offset, length) = if opcode == JSR {
                    (i2!(1) as i32, 3)
                } else {
                    (i4!(1), 5)
                };
                stack!().push_return_address(pc + length);
                branch!(offset, length, true, false)
            }
            RET => self.ret(top, u1!(1) as usize),
            TABLESWITCH => {
                let base = opcodes::switch_padding(pc) + 1;
                let key = pop!(pop_int);
                let low = i4!(base + 4);
                let high = i4!(base + 8);
                let offset = if key < low || key > high {
                    i4!(base)
                } else {
                    i4!(base + 12 + 4 * (key as i64 - low as i64) as usize)
                };
                branch!(offset, 0, true, true)
            }
            LOOKUPSWITCH => {
                let base = opcodes::switch_padding(pc) + 1;
                let key = pop!(pop_int);
                let pairs = i4!(base + 4) as usize;
                let mut offset = i4!(base);
                for i in 0..pairs {
                    let at = base + 8 + 8 * i;
                    if i4!(at) == key {
                        offset = i4!(at + 4);
                        break;
                    }
                }
                branch!(offset, 0, true, true)
            }

            IRETURN => StepResult::Returned(Some(Value::Int(pop!(pop_int)))),
            LRETURN => StepResult::Returned(Some(Value::Long(pop!(pop_long)))),
            FRETURN => StepResult::Returned(Some(Value::Float(pop!(pop_float)))),
            DRETURN => StepResult::Returned(Some(Value::Double(pop!(pop_double)))),
            ARETURN => StepResult::Returned(Some(Value::Ref(pop!(pop_ref)))),
            RETURN => StepResult::Returned(None),

            GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD => {
                let index = u2!(1);
                let field_id = resolved!(resolve_field(index));
                let field = runtime.resolver.field(field_id);
                let result = self.field_instruction(opcode, field);
                if result != StepResult::Continue {
                    return result;
                }
                next!(3)
            }

            INVOKEVIRTUAL => self.invoke_instruction(InvokeKind::Virtual, u2!(1), 3),
            INVOKESPECIAL => self.invoke_instruction(InvokeKind::Special, u2!(1), 3),
            INVOKESTATIC => self.invoke_instruction(InvokeKind::Static, u2!(1), 3),
            INVOKEINTERFACE => self.invoke_instruction(InvokeKind::Interface, u2!(1), 5),
            INVOKEDYNAMIC => self.fatal("invokedynamic is not supported by this interpreter"),

            NEW => {
                let class = resolved!(resolve_class(u2!(1)));
                let description = runtime.resolver.class(class);
                if description.is_interface()
                    || description.is_array()
                    || description.flags.contains(crate::types::AccessFlags::ABSTRACT)
                {
                    return self.raise(WellKnown::InstantiationError, Some(description.name.clone()));
                }
                let object = runtime.heap.new_instance(&description, &*runtime.resolver);
                push!(push_ref, object);
                next!(3)
            }
            NEWARRAY => {
                let Some(element) = BasicType::from_array_type_code(u1!(1)) else {
                    self.fatal(&format!("bad newarray type code {}", u1!(1)));
                };
                let count = pop!(pop_int);
                match self.allocate_array(ArrayElement::Primitive(element), count) {
                    Ok(array) => push!(push_ref, array),
                    Err(result) => return result,
                }
                next!(2)
            }
            ANEWARRAY => {
                let component = resolved!(resolve_class(u2!(1)));
                let count = pop!(pop_int);
                match self.allocate_array(ArrayElement::Reference(component), count) {
                    Ok(array) => push!(push_ref, array),
                    Err(result) => return result,
                }
                next!(3)
            }
            MULTIANEWARRAY => {
                let class = resolved!(resolve_class(u2!(1)));
                let dimensions = u1!(3) as usize;
                let mut counts = vec![0; dimensions];
                for c in counts.iter_mut().rev() {
                    *c = pop!(pop_int);
                }
                if let Some(negative) = counts.iter().find(|c| **c < 0) {
                    return self.raise(
                        WellKnown::NegativeArraySizeException,
                        Some(negative.to_string()),
                    );
                }
                let array = self.allocate_multi(class, &counts);
                push!(push_ref, array);
                next!(4)
            }
            ARRAYLENGTH => {
                let array = non_null!(pop!(pop_ref), "Cannot read the array length of null");
                let Some(length) = runtime.heap.array_length(array) else {
                    self.fatal("arraylength on a non-array");
                };
                push!(push_int, length as i32);
                next!(1)
            }
            ATHROW => {
                let exception = pop!(pop_ref);
                self.throw(exception)
            }
            CHECKCAST => {
                let object = stack!().peek_ref(0);
                if !object.is_null() {
                    let target = resolved!(resolve_class(u2!(1)));
                    let class = runtime.heap.class_of(object);
                    if !runtime.resolver.is_assignable(class, target) {
                        let from = runtime.resolver.class(class);
                        let to = runtime.resolver.class(target);
                        return self.raise(
                            WellKnown::ClassCastException,
                            Some(format!("class {from} cannot be cast to class {to}")),
                        );
                    }
                }
                next!(3)
            }
            INSTANCEOF => {
                let object = pop!(pop_ref);
                let result = if object.is_null() {
                    0
                } else {
                    let target = resolved!(resolve_class(u2!(1)));
                    runtime
                        .resolver
                        .is_assignable(runtime.heap.class_of(object), target) as i32
                };
                push!(push_int, result);
                next!(3)
            }
            MONITORENTER => {
                let object = non_null!(pop!(pop_ref), "Cannot enter a synchronized block on null");
                runtime.monitors.monitor_enter(thread, object);
                vm_trace_monitor!(self, "enter", object);
                frame!().monitors.push(object);
                next!(1)
            }
            MONITOREXIT => {
                let object = non_null!(pop!(pop_ref), "Cannot exit a synchronized block on null");
                if let Err(e) = runtime.monitors.monitor_exit(thread, object) {
                    return self.raise(WellKnown::IllegalMonitorStateException, Some(e.to_string()));
                }
                vm_trace_monitor!(self, "exit", object);
                if !frame!().monitors.remove(object) {
                    vm_msg!(self, "-- monitor {:?} exited but not entered by this frame --", object);
                    tracing::debug!(?object, pc, "monitorexit of a monitor entered by another frame");
                }
                next!(1)
            }
            WIDE => {
                let index = u2!(2) as usize;
                match u1!(1) {
                    ILOAD | FLOAD | ALOAD => load!(index, false, 4),
                    LLOAD | DLOAD => load!(index, true, 4),
                    ISTORE | FSTORE | ASTORE => store!(index, false, 4),
                    LSTORE | DSTORE => store!(index, true, 4),
                    RET => self.ret(top, index),
                    IINC => {
                        let value = locals!().get_int(index).wrapping_add(i2!(4) as i32);
                        locals!().set_int(index, value);
                        next!(6)
                    }
                    other => self.fatal(&format!("{} cannot be widened", opcodes::mnemonic(other))),
                }
            }
            other => self.fatal(&format!(
                "undefined opcode {other:#04x} ({}) at {method:?} @ {pc}",
                opcodes::mnemonic(other)
            )),
        }
    }

    fn ret(&mut self, top: usize, index: usize) -> StepResult {
        let locals = &self.frames[top].locals;
        if locals.tag(index) != Tag::ReturnAddress {
            self.fatal(&format!("ret through local {index}, which holds no return address"));
        }
        let target = locals.get(index).as_return_address();
        vm_trace_branch!(self, "RET", target, true);
        self.frames[top].pc = target;
        StepResult::Continue
    }

    fn array_element(&mut self, array: ObjectRef, index: i32) -> Result<Value, StepResult> {
        let heap = &self.runtime.heap;
        let loaded = usize::try_from(index)
            .ok()
            .and_then(|i| heap.array_load(array, i));
        match loaded {
            Some(v) => Ok(v),
            None => {
                let length = heap.array_length(array).unwrap_or(0);
                Err(self.out_of_bounds(index, length))
            }
        }
    }

    fn store_element(&mut self, array: ObjectRef, index: i32, value: Value) -> Result<(), StepResult> {
        let runtime = self.runtime.clone();
        if let Value::Ref(element) = value {
            if !element.is_null() {
                let array_class = runtime.resolver.class(runtime.heap.class_of(array));
                if let Some(ArrayElement::Reference(component)) = array_class.element {
                    let element_class = runtime.heap.class_of(element);
                    if !runtime.resolver.is_assignable(element_class, component) {
                        let name = runtime.resolver.class(element_class).name.clone();
                        return Err(self.raise(WellKnown::ArrayStoreException, Some(name)));
                    }
                }
            }
        }
        let stored = usize::try_from(index)
            .map(|i| runtime.heap.array_store(array, i, value))
            .unwrap_or(false);
        if !stored {
            let length = runtime.heap.array_length(array).unwrap_or(0);
            return Err(self.out_of_bounds(index, length));
        }
        Ok(())
    }

    fn out_of_bounds(&mut self, index: i32, length: usize) -> StepResult {
        self.raise(
            WellKnown::ArrayIndexOutOfBoundsException,
            Some(format!("Index {index} out of bounds for length {length}")),
        )
    }

    fn allocate_array(&mut self, element: ArrayElement, count: i32) -> Result<ObjectRef, StepResult> {
        if count < 0 {
            return Err(self.raise(WellKnown::NegativeArraySizeException, Some(count.to_string())));
        }
        let runtime = &self.runtime;
        let class = runtime.resolver.array_class(element);
        Ok(runtime.heap.new_array(class, element, count as usize))
    }

    /// Allocates nested arrays for `multianewarray`. `counts` are all
    /// non-negative; dimensions past the counts stay null.
    fn allocate_multi(&self, class: crate::types::ClassId, counts: &[i32]) -> ObjectRef {
        let runtime = &self.runtime;
        let description = runtime.resolver.class(class);
        let Some(element) = description.element else {
            self.fatal(&format!("multianewarray of non-array class {description}"));
        };
        let array = runtime.heap.new_array(class, element, counts[0] as usize);
        if let (Some(rest), ArrayElement::Reference(component)) = (counts.get(1..), element) {
            if !rest.is_empty() {
                for i in 0..counts[0] as usize {
                    let inner = self.allocate_multi(component, rest);
                    runtime.heap.array_store(array, i, Value::Ref(inner));
                }
            }
        }
        array
    }

    /// `getstatic`, `putstatic`, `getfield` and `putfield` on a resolved
    /// field. Leaves the pc alone.
    fn field_instruction(&mut self, opcode: u8, field: Arc<FieldDescription>) -> StepResult {
        let runtime = self.runtime.clone();
        let events = runtime.config.events;
        let thread = self.thread_id();
        let location = Location::of(self.current_frame());
        let is_static_op = matches!(opcode, GETSTATIC | PUTSTATIC);

        if field.is_static() != is_static_op {
            let class = runtime.resolver.class(field.class);
            let expected = if is_static_op { "static" } else { "non-static" };
            return self.raise(
                WellKnown::IncompatibleClassChangeError,
                Some(format!("Expected {expected} field {class}.{}", field.name)),
            );
        }

        match opcode {
            GETSTATIC => {
                if events.contains(EventMask::FIELD_ACCESS) {
                    if let Some(hooks) = &runtime.hooks {
                        hooks.field_access(thread, location, &field, None);
                    }
                }
                let value = runtime.statics.get(&field);
                vm_trace_field!(self, "getstatic", field, value);
                self.current_frame_mut().stack.push_value(value);
            }
            PUTSTATIC => {
                let value = self.current_frame_mut().stack.pop_value(field.field_type);
                let value = value.narrow_to(field.field_type);
                if events.contains(EventMask::FIELD_MODIFICATION) {
                    if let Some(hooks) = &runtime.hooks {
                        hooks.field_modification(thread, location, &field, None, value);
                    }
                }
                vm_trace_field!(self, "putstatic", field, value);
                runtime.statics.set(&field, value);
            }
            GETFIELD => {
                let object = self.current_frame_mut().stack.pop_ref();
                if object.is_null() {
                    return self.raise(
                        WellKnown::NullPointerException,
                        Some(format!("Cannot read field \"{}\" of null", field.name)),
                    );
                }
                if events.contains(EventMask::FIELD_ACCESS) {
                    if let Some(hooks) = &runtime.hooks {
                        hooks.field_access(thread, location, &field, Some(object));
                    }
                }
                let value = runtime.heap.get_field(object, field.slot);
                vm_trace_field!(self, "getfield", field, value);
                self.current_frame_mut().stack.push_value(value);
            }
            PUTFIELD => {
                let value = self.current_frame_mut().stack.pop_value(field.field_type);
                let value = value.narrow_to(field.field_type);
                let object = self.current_frame_mut().stack.pop_ref();
                if object.is_null() {
                    return self.raise(
                        WellKnown::NullPointerException,
                        Some(format!("Cannot assign field \"{}\" of null", field.name)),
                    );
                }
                if events.contains(EventMask::FIELD_MODIFICATION) {
                    if let Some(hooks) = &runtime.hooks {
                        hooks.field_modification(thread, location, &field, Some(object), value);
                    }
                }
                vm_trace_field!(self, "putfield", field, value);
                runtime.heap.set_field(object, field.slot, value);
            }
            _ => unreachable!("not a field instruction"),
        }
        StepResult::Continue
    }
}

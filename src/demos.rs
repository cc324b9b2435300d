//! Built-in guest programs for the command line runner.
use crate::{
    assembler::Assembler,
    error::ProgramError,
    resolve::{ClassBuilder, ClassRegistry, MethodBuilder, Resolver},
    types::{AccessFlags, BasicType, ClassId, MethodId, WellKnown},
    value::Value,
    vm::{opcodes::*, CallStack, ExecutionResult, InterpreterConfig, Runtime},
};
use std::{
    sync::{atomic::Ordering, Arc},
    thread,
};

pub const DEMO_CLASS: &str = "demo/Programs";

/// Threads started by [`Program::Sync`].
pub const SYNC_THREADS: usize = 4;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Program {
    /// Naive recursive Fibonacci.
    Fib,
    /// Fills an int array with 1..=n and adds it up.
    Sum,
    /// Divides 100 by the input, returning -1 when that throws.
    Catch,
    /// Several threads bump a counter through a synchronized method.
    Sync,
}

impl Program {
    fn entry(self) -> (&'static str, &'static str) {
        match self {
            Program::Fib => ("fib", "(I)I"),
            Program::Sum => ("sum", "(I)I"),
            Program::Catch => ("safeDivide", "(I)I"),
            Program::Sync => ("bump", "(I)V"),
        }
    }
}

const STATIC: AccessFlags = AccessFlags::PUBLIC.union(AccessFlags::STATIC);

fn fib(class: &mut ClassBuilder) -> Result<MethodBuilder, ProgramError> {
    let this = class.method_ref(DEMO_CLASS, "fib", "(I)I");
    let mut a = Assembler::new();
    let recurse = a.label();
    a.iload(0).iconst(2).branch(IF_ICMPGE, recurse);
    a.iload(0).op(IRETURN);
    a.bind(recurse);
    a.iload(0).iconst(1).op(ISUB).invoke(INVOKESTATIC, this);
    a.iload(0).iconst(2).op(ISUB).invoke(INVOKESTATIC, this);
    a.op(IADD).op(IRETURN);
    Ok(MethodBuilder::new("fib", "(I)I", STATIC).code(3, 1, a.finish()?))
}

fn sum() -> Result<MethodBuilder, ProgramError> {
    // locals: 0 = n, 1 = array, 2 = i, 3 = total
    let mut a = Assembler::new();
    a.iload(0).newarray(BasicType::Int).astore(1);

    let (fill, filled) = (a.label(), a.label());
    a.iconst(0).istore(2);
    a.bind(fill);
    a.iload(2).iload(0).branch(IF_ICMPGE, filled);
    a.aload(1).iload(2).iload(2).iconst(1).op(IADD).op(IASTORE);
    a.iinc(2, 1).branch(GOTO, fill);
    a.bind(filled);

    let (add, done) = (a.label(), a.label());
    a.iconst(0).istore(3).iconst(0).istore(2);
    a.bind(add);
    a.iload(2).aload(1).op(ARRAYLENGTH).branch(IF_ICMPGE, done);
    a.iload(3).aload(1).iload(2).op(IALOAD).op(IADD).istore(3);
    a.iinc(2, 1).branch(GOTO, add);
    a.bind(done);
    a.iload(3).op(IRETURN);
    Ok(MethodBuilder::new("sum", "(I)I", STATIC).code(4, 4, a.finish()?))
}

fn safe_divide(class: &mut ClassBuilder) -> Result<MethodBuilder, ProgramError> {
    let arithmetic = class.class_ref(WellKnown::ArithmeticException.class_name());
    let mut a = Assembler::new();
    a.iconst(100).iload(0).op(IDIV).op(IRETURN);
    let end = a.pc() as u16;
    a.op(POP).iconst(-1).op(IRETURN);
    Ok(MethodBuilder::new("safeDivide", "(I)I", STATIC)
        .code(2, 1, a.finish()?)
        .handler(0, end, end, arithmetic))
}

fn counter(class: &mut ClassBuilder) -> Result<[MethodBuilder; 3], ProgramError> {
    let count = class.field_ref(DEMO_CLASS, "count", "I");
    let increment_ref = class.method_ref(DEMO_CLASS, "increment", "()V");

    let mut a = Assembler::new();
    a.op_u2(GETSTATIC, count).iconst(1).op(IADD).op_u2(PUTSTATIC, count).op(RETURN);
    let increment = MethodBuilder::new("increment", "()V", STATIC | AccessFlags::SYNCHRONIZED)
        .code(2, 0, a.finish()?);

    let mut a = Assembler::new();
    let (top, done) = (a.label(), a.label());
    a.bind(top);
    a.iload(0).branch(IFLE, done);
    a.invoke(INVOKESTATIC, increment_ref).iinc(0, -1).branch(GOTO, top);
    a.bind(done).op(RETURN);
    let bump = MethodBuilder::new("bump", "(I)V", STATIC).code(1, 1, a.finish()?);

    let mut a = Assembler::new();
    a.op_u2(GETSTATIC, count).op(IRETURN);
    let read = MethodBuilder::new("count", "()I", STATIC).code(1, 0, a.finish()?);

    Ok([increment, bump, read])
}

/// Defines the class holding every demo program.
pub fn define(registry: &ClassRegistry) -> Result<ClassId, ProgramError> {
    let mut class = ClassBuilder::new(DEMO_CLASS);
    class.field("count", "I", AccessFlags::STATIC);
    let methods = [fib(&mut class)?, sum()?, safe_divide(&mut class)?];
    for m in methods.into_iter().chain(counter(&mut class)?) {
        class.method(m);
    }
    Ok(registry.define(class)?)
}

fn find(registry: &ClassRegistry, class: ClassId, name: &str, descriptor: &str) -> Result<MethodId, ProgramError> {
    registry
        .find_method(class, name, descriptor)
        .ok_or_else(|| ProgramError::MissingMethod(format!("{name}{descriptor}")))
}

/// Runs `program` on `input` in a fresh runtime.
pub fn run(program: Program, input: i32, config: InterpreterConfig) -> Result<ExecutionResult, ProgramError> {
    let registry = Arc::new(ClassRegistry::new());
    let class = define(&registry)?;
    let (name, descriptor) = program.entry();
    let entry = find(&registry, class, name, descriptor)?;
    let runtime = Arc::new(Runtime::new(registry.clone(), config));

    if program != Program::Sync {
        let mut stack = CallStack::new(runtime);
        return Ok(stack.invoke(entry, &[Value::Int(input)]));
    }

    let outcomes: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..SYNC_THREADS)
            .map(|_| {
                let runtime = runtime.clone();
                s.spawn(move || CallStack::new(runtime).invoke(entry, &[Value::Int(input)]))
            })
            .collect();
        workers.into_iter().map(|w| w.join()).collect()
    });
    for outcome in outcomes {
        match outcome {
            Ok(ExecutionResult::Returned(_)) => {}
            Ok(threw) => return Ok(threw),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
    tracing::info!(
        contentions = runtime.metrics.lock_contention_count.load(Ordering::Relaxed),
        "sync demo threads finished"
    );

    let read = find(&registry, class, "count", "()I")?;
    Ok(CallStack::new(runtime).invoke(read, &[]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn returned(program: Program, input: i32) -> Option<Value> {
        run(program, input, InterpreterConfig::default())
            .unwrap()
            .returned()
    }

    #[test]
    fn test_fib() {
        assert_eq!(returned(Program::Fib, 15), Some(Value::Int(610)));
    }

    #[test]
    fn test_sum() {
        assert_eq!(returned(Program::Sum, 100), Some(Value::Int(5050)));
        assert_eq!(returned(Program::Sum, 0), Some(Value::Int(0)));
    }

    #[test]
    fn test_catch() {
        assert_eq!(returned(Program::Catch, 7), Some(Value::Int(14)));
        assert_eq!(returned(Program::Catch, 0), Some(Value::Int(-1)));
    }

    #[test]
    fn test_sync() {
        assert_eq!(
            returned(Program::Sync, 500),
            Some(Value::Int(500 * SYNC_THREADS as i32))
        );
    }

    #[test]
    fn test_negative_sum_throws() {
        let result = run(Program::Sum, -1, InterpreterConfig::default()).unwrap();
        assert!(matches!(result, ExecutionResult::Threw(_)));
    }
}

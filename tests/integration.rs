use jvm_rs::{
    assembler::Assembler,
    error::MonitorStateError,
    resolve::{ClassBuilder, ClassRegistry, MethodBuilder, Resolver},
    types::{AccessFlags, ClassId, FieldDescription, MethodDescription, MethodId, NativeBinding, WellKnown},
    value::{AddressingMode, Compressed, ObjectRef, Tag, Uncompressed, Value},
    vm::{
        opcodes::*, tracer::Tracer, CallStack, DebugHooks, EventMask, ExecutionResult, Frame, FramePopListener,
        InterpreterConfig, Location, Root, RootKind, Runtime, SafepointHandler, StopTheWorld,
        SyncBlockManager, Synchronizer, ThreadId,
    },
};
use parking_lot::Mutex;
use std::{
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

const MAIN: &str = "test/Main";
const STATIC: AccessFlags = AccessFlags::PUBLIC.union(AccessFlags::STATIC);

fn method(name: &str, descriptor: &str, flags: AccessFlags, max_stack: u16, max_locals: u16, a: Assembler) -> MethodBuilder {
    MethodBuilder::new(name, descriptor, flags).code(max_stack, max_locals, a.finish().unwrap())
}

fn find(registry: &ClassRegistry, class: &str, name: &str, descriptor: &str) -> MethodId {
    let class = registry.class_named(class).unwrap();
    registry.find_method(class, name, descriptor).unwrap()
}

fn exception_name(runtime: &Runtime, result: ExecutionResult) -> String {
    match result {
        ExecutionResult::Threw(e) => runtime.resolver.class(runtime.heap.class_of(e)).name.clone(),
        other => panic!("expected an exception, got {other:?}"),
    }
}

fn static_field(registry: &ClassRegistry, class: &str, index: usize) -> Arc<FieldDescription> {
    let class = registry.class(registry.class_named(class).unwrap());
    registry.field(class.static_fields[index])
}

/// `bump()V` increments the static `count`, `twice()I` calls it twice and
/// returns the count.
fn counter_class(registry: &ClassRegistry, synchronized: bool) -> ClassId {
    let mut class = ClassBuilder::new(MAIN);
    class.field("count", "I", AccessFlags::STATIC);
    let count = class.field_ref(MAIN, "count", "I");
    let bump = class.method_ref(MAIN, "bump", "()V");

    let mut a = Assembler::new();
    a.op_u2(GETSTATIC, count).iconst(1).op(IADD).op_u2(PUTSTATIC, count).op(RETURN);
    let flags = if synchronized { STATIC | AccessFlags::SYNCHRONIZED } else { STATIC };
    class.method(method("bump", "()V", flags, 2, 0, a));

    let mut a = Assembler::new();
    a.invoke(INVOKESTATIC, bump).invoke(INVOKESTATIC, bump).op_u2(GETSTATIC, count).op(IRETURN);
    class.method(method("twice", "()I", STATIC, 1, 0, a));

    let mut a = Assembler::new();
    a.invoke(INVOKESTATIC, bump).op(RETURN);
    class.method(method("once", "()V", STATIC, 0, 0, a));

    registry.define(class).unwrap()
}

#[test]
fn test_recursive_calls() {
    assert_eq!(
        jvm_rs::demos::run(jvm_rs::demos::Program::Fib, 20, InterpreterConfig::default())
            .unwrap()
            .returned(),
        Some(Value::Int(6765))
    );
}

#[test]
fn test_wide_arguments_cross_calls() {
    let registry = Arc::new(ClassRegistry::new());
    let mut class = ClassBuilder::new(MAIN);
    let callee = class.method_ref(MAIN, "combine", "(JIJ)J");
    let (x, y) = (class.long(1 << 40), class.long(-3));

    let mut a = Assembler::new();
    a.lload(0).iload(2).op(I2L).op(LSUB).lload(3).op(LMUL).op(LRETURN);
    class.method(method("combine", "(JIJ)J", STATIC, 4, 5, a));

    let mut a = Assembler::new();
    a.ldc2(x).iconst(7).ldc2(y).invoke(INVOKESTATIC, callee).op(LRETURN);
    class.method(method("main", "()J", STATIC, 5, 0, a));
    registry.define(class).unwrap();

    let main = find(&registry, MAIN, "main", "()J");
    let runtime = Arc::new(Runtime::new(registry, InterpreterConfig::default()));
    assert_eq!(
        CallStack::new(runtime).invoke(main, &[]).returned(),
        Some(Value::Long(((1 << 40) - 7) * -3))
    );
}

fn animals(registry: &ClassRegistry) {
    let mut shape = ClassBuilder::new_interface("test/Shape");
    shape.method(MethodBuilder::new("sides", "()I", AccessFlags::PUBLIC | AccessFlags::ABSTRACT));
    registry.define(shape).unwrap();

    let mut animal = ClassBuilder::new("test/Animal");
    animal.flags(AccessFlags::ABSTRACT);
    let mut a = Assembler::new();
    a.iconst(1).op(IRETURN);
    animal.method(method("speak", "()I", AccessFlags::PUBLIC, 1, 1, a));
    animal.method(MethodBuilder::new("legs", "()I", AccessFlags::PUBLIC | AccessFlags::ABSTRACT));
    registry.define(animal).unwrap();

    let mut dog = ClassBuilder::new("test/Dog");
    dog.extends("test/Animal").implements("test/Shape");
    let mut a = Assembler::new();
    a.iconst(2).op(IRETURN);
    dog.method(method("speak", "()I", AccessFlags::PUBLIC, 1, 1, a));
    let mut a = Assembler::new();
    a.iconst(4).op(IRETURN);
    dog.method(method("legs", "()I", AccessFlags::PUBLIC, 1, 1, a));
    let mut a = Assembler::new();
    a.iconst(6).op(IRETURN);
    dog.method(method("sides", "()I", AccessFlags::PUBLIC, 1, 1, a));
    registry.define(dog).unwrap();

    // forgets to implement legs()
    let mut cat = ClassBuilder::new("test/Cat");
    cat.extends("test/Animal").implements("test/Shape");
    let mut a = Assembler::new();
    a.iconst(3).op(IRETURN);
    cat.method(method("sides", "()I", AccessFlags::empty(), 1, 1, a));
    registry.define(cat).unwrap();
}

/// `call(Ljava/lang/Object;)I` applying `kind` to the given method.
fn dispatcher(registry: &ClassRegistry, opcode: u8, class: &str, name: &str) {
    let mut main = ClassBuilder::new(MAIN);
    let target = if opcode == INVOKEINTERFACE {
        main.interface_method_ref(class, name, "()I")
    } else {
        main.method_ref(class, name, "()I")
    };
    let mut a = Assembler::new();
    a.aload(0);
    if opcode == INVOKEINTERFACE {
        a.invokeinterface(target, 1);
    } else {
        a.invoke(opcode, target);
    }
    a.op(IRETURN);
    main.method(method("call", "(Ljava/lang/Object;)I", STATIC, 1, 1, a));
    registry.define(main).unwrap();
}

fn dispatch(opcode: u8, class: &str, name: &str, receiver: &str) -> (Arc<Runtime>, ExecutionResult) {
    let registry = Arc::new(ClassRegistry::new());
    animals(&registry);
    dispatcher(&registry, opcode, class, name);
    let call = find(&registry, MAIN, "call", "(Ljava/lang/Object;)I");
    let runtime = Arc::new(Runtime::new(registry.clone(), InterpreterConfig::default()));

    let receiver = if receiver == "null" {
        ObjectRef::NULL
    } else {
        let class = registry.class(registry.class_named(receiver).unwrap());
        runtime.heap.new_instance(&class, &*registry)
    };
    let result = CallStack::new(runtime.clone()).invoke(call, &[Value::Ref(receiver)]);
    (runtime, result)
}

#[test]
fn test_virtual_dispatch() {
    let (_, result) = dispatch(INVOKEVIRTUAL, "test/Animal", "speak", "test/Dog");
    assert_eq!(result.returned(), Some(Value::Int(2)));
    let (_, result) = dispatch(INVOKEVIRTUAL, "test/Animal", "legs", "test/Dog");
    assert_eq!(result.returned(), Some(Value::Int(4)));
    // invokespecial skips the override
    let (_, result) = dispatch(INVOKESPECIAL, "test/Animal", "speak", "test/Dog");
    assert_eq!(result.returned(), Some(Value::Int(1)));
}

#[test]
fn test_virtual_dispatch_errors() {
    let (runtime, result) = dispatch(INVOKEVIRTUAL, "test/Animal", "legs", "test/Cat");
    assert_eq!(exception_name(&runtime, result), WellKnown::AbstractMethodError.class_name());

    let (runtime, result) = dispatch(INVOKEVIRTUAL, "test/Animal", "speak", "null");
    assert_eq!(exception_name(&runtime, result), WellKnown::NullPointerException.class_name());

    let (runtime, result) = dispatch(INVOKESTATIC, "test/Animal", "speak", "test/Dog");
    assert_eq!(
        exception_name(&runtime, result),
        WellKnown::IncompatibleClassChangeError.class_name()
    );

    let (runtime, result) = dispatch(INVOKEVIRTUAL, "test/Animal", "missing", "test/Dog");
    assert_eq!(exception_name(&runtime, result), WellKnown::NoSuchMethodError.class_name());
}

#[test]
fn test_interface_dispatch() {
    let (_, result) = dispatch(INVOKEINTERFACE, "test/Shape", "sides", "test/Dog");
    assert_eq!(result.returned(), Some(Value::Int(6)));

    let (runtime, result) = dispatch(INVOKEINTERFACE, "test/Shape", "sides", "java/lang/Object");
    assert_eq!(
        exception_name(&runtime, result),
        WellKnown::IncompatibleClassChangeError.class_name()
    );

    let (runtime, result) = dispatch(INVOKEINTERFACE, "test/Shape", "sides", "test/Cat");
    assert_eq!(exception_name(&runtime, result), WellKnown::IllegalAccessError.class_name());
}

/// `outer()I` calls `inner()I` inside a try block whose handler returns -1.
/// `inner` divides by zero.
fn catching_class(registry: &ClassRegistry, catch: &str) -> (MethodId, MethodId) {
    let mut class = ClassBuilder::new(MAIN);
    let inner = class.method_ref(MAIN, "inner", "()I");
    let catch_type = if catch.is_empty() { 0 } else { class.class_ref(catch) };

    let mut a = Assembler::new();
    a.iconst(1).iconst(0).op(IDIV).op(IRETURN);
    class.method(method("inner", "()I", STATIC, 2, 0, a));

    let mut a = Assembler::new();
    a.invoke(INVOKESTATIC, inner).op(IRETURN);
    let end = a.pc() as u16;
    a.op(POP).iconst(-1).op(IRETURN);
    class.method(
        MethodBuilder::new("outer", "()I", STATIC)
            .code(1, 0, a.finish().unwrap())
            .handler(0, end, end, catch_type),
    );
    registry.define(class).unwrap();
    (
        find(registry, MAIN, "outer", "()I"),
        find(registry, MAIN, "inner", "()I"),
    )
}

#[test]
fn test_exception_unwinds_to_caller_handler() {
    for catch in ["java/lang/ArithmeticException", "java/lang/RuntimeException", ""] {
        let registry = Arc::new(ClassRegistry::new());
        let (outer, _) = catching_class(&registry, catch);
        let runtime = Arc::new(Runtime::new(registry, InterpreterConfig::default()));
        let mut stack = CallStack::new(runtime);
        assert_eq!(stack.invoke(outer, &[]).returned(), Some(Value::Int(-1)), "{catch}");
        assert_eq!(stack.depth(), 0);
        assert!(stack.pending_exception().is_none());
    }
}

#[test]
fn test_non_matching_handler_is_skipped() {
    for catch in ["java/lang/NullPointerException", "does/not/Exist"] {
        let registry = Arc::new(ClassRegistry::new());
        let (outer, _) = catching_class(&registry, catch);
        let runtime = Arc::new(Runtime::new(registry, InterpreterConfig::default()));
        let mut stack = CallStack::new(runtime.clone());
        let result = stack.invoke(outer, &[]);
        assert_eq!(exception_name(&runtime, result), WellKnown::ArithmeticException.class_name());
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.take_pending_exception().map(ExecutionResult::Threw), Some(result));
    }
}

#[test]
fn test_shutdown_only_runs_catch_all_handlers() {
    let registry = Arc::new(ClassRegistry::new());
    let (outer, _) = catching_class(&registry, "java/lang/ArithmeticException");
    let runtime = Arc::new(Runtime::new(registry, InterpreterConfig::default()));
    runtime.begin_shutdown();
    let result = CallStack::new(runtime.clone()).invoke(outer, &[]);
    assert_eq!(exception_name(&runtime, result), WellKnown::ArithmeticException.class_name());

    let registry = Arc::new(ClassRegistry::new());
    let (outer, _) = catching_class(&registry, "");
    let runtime = Arc::new(Runtime::new(registry, InterpreterConfig::default()));
    runtime.begin_shutdown();
    assert_eq!(
        CallStack::new(runtime).invoke(outer, &[]).returned(),
        Some(Value::Int(-1))
    );
}

/// `recurse()V` never returns, `caught()I` survives one overflow and
/// `probe()I` survives one and then overflows uncaught.
fn recursion(registry: &ClassRegistry) -> (MethodId, MethodId, MethodId) {
    let mut class = ClassBuilder::new(MAIN);
    let recurse = class.method_ref(MAIN, "recurse", "()V");
    let overflow = class.class_ref(WellKnown::StackOverflowError.class_name());

    let mut a = Assembler::new();
    a.invoke(INVOKESTATIC, recurse).op(RETURN);
    class.method(method("recurse", "()V", STATIC, 0, 0, a));

    let mut a = Assembler::new();
    a.invoke(INVOKESTATIC, recurse);
    let end = a.pc() as u16;
    a.iconst(0).op(IRETURN);
    a.op(POP).iconst(1).op(IRETURN);
    class.method(
        MethodBuilder::new("caught", "()I", STATIC)
            .code(1, 0, a.finish().unwrap())
            .handler(0, end, end + 2, overflow),
    );

    let mut a = Assembler::new();
    a.invoke(INVOKESTATIC, recurse);
    let end = a.pc() as u16;
    a.iconst(0).op(IRETURN);
    a.op(POP).invoke(INVOKESTATIC, recurse).iconst(1).op(IRETURN);
    class.method(
        MethodBuilder::new("probe", "()I", STATIC)
            .code(1, 0, a.finish().unwrap())
            .handler(0, end, end + 2, overflow),
    );
    registry.define(class).unwrap();
    (
        find(registry, MAIN, "recurse", "()V"),
        find(registry, MAIN, "caught", "()I"),
        find(registry, MAIN, "probe", "()I"),
    )
}

fn small_stack() -> InterpreterConfig {
    InterpreterConfig {
        stack_slots: 4096,
        stack_guard: 256,
        ..InterpreterConfig::default()
    }
}

#[test]
fn test_stack_overflow() {
    let registry = Arc::new(ClassRegistry::new());
    let (recurse, _, probe) = recursion(&registry);
    let runtime = Arc::new(Runtime::new(registry, small_stack()));

    let mut stack = CallStack::new(runtime.clone());
    let result = stack.invoke(recurse, &[]);
    assert_eq!(exception_name(&runtime, result), WellKnown::StackOverflowError.class_name());
    assert_eq!(stack.depth(), 0);
    assert_eq!(stack.slots_in_use(), 0);

    // the handler clears the latch, so the second overflow is raised too
    let mut stack = CallStack::new(runtime.clone());
    let result = stack.invoke(probe, &[]);
    assert_eq!(exception_name(&runtime, result), WellKnown::StackOverflowError.class_name());
    assert_eq!(stack.slots_in_use(), 0);
}

#[test]
fn test_repeated_overflows_on_one_thread() {
    let registry = Arc::new(ClassRegistry::new());
    let (recurse, caught, probe) = recursion(&registry);
    let runtime = Arc::new(Runtime::new(registry, small_stack()));
    let mut stack = CallStack::new(runtime.clone());

    for _ in 0..2 {
        assert_eq!(stack.invoke(caught, &[]).returned(), Some(Value::Int(1)));
        assert_eq!(stack.slots_in_use(), 0);
    }
    for entry in [recurse, recurse, probe, caught, recurse] {
        let result = stack.invoke(entry, &[]);
        if entry == caught {
            assert_eq!(result.returned(), Some(Value::Int(1)));
        } else {
            assert_eq!(exception_name(&runtime, result), WellKnown::StackOverflowError.class_name());
        }
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.slots_in_use(), 0);
    }
}

/// Counts enters and exits on top of the real monitors.
struct CountingMonitors {
    inner: SyncBlockManager,
    enters: AtomicUsize,
    exits: AtomicUsize,
}

impl CountingMonitors {
    fn new() -> Self {
        Self {
            inner: SyncBlockManager::default(),
            enters: AtomicUsize::new(0),
            exits: AtomicUsize::new(0),
        }
    }

    fn balanced(&self) -> bool {
        self.enters.load(Ordering::SeqCst) == self.exits.load(Ordering::SeqCst)
    }
}

impl Synchronizer for CountingMonitors {
    fn monitor_enter(&self, thread: ThreadId, object: ObjectRef) {
        self.enters.fetch_add(1, Ordering::SeqCst);
        self.inner.monitor_enter(thread, object);
    }

    fn monitor_exit(&self, thread: ThreadId, object: ObjectRef) -> Result<(), MonitorStateError> {
        self.inner.monitor_exit(thread, object)?;
        self.exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn try_enter(&self, thread: ThreadId, object: ObjectRef) -> bool {
        self.inner.try_enter(thread, object)
    }
}

#[test]
fn test_monitors_released_on_unwind() {
    let registry = Arc::new(ClassRegistry::new());
    let mut class = ClassBuilder::new(MAIN);
    let mut a = Assembler::new();
    // enters twice, leaves once, then throws
    a.aload(0).op(MONITORENTER).aload(0).op(MONITORENTER).aload(0).op(MONITOREXIT);
    a.iconst(1).iconst(0).op(IDIV).op(POP).op(RETURN);
    class.method(method(
        "locked",
        "(Ljava/lang/Object;)V",
        STATIC | AccessFlags::SYNCHRONIZED,
        2,
        1,
        a,
    ));
    registry.define(class).unwrap();
    let locked = find(&registry, MAIN, "locked", "(Ljava/lang/Object;)V");

    let monitors = Arc::new(CountingMonitors::new());
    let runtime = Arc::new(
        Runtime::new(registry.clone(), InterpreterConfig::default()).with_monitors(monitors.clone()),
    );
    let object_class = registry.class(registry.well_known(WellKnown::Object));
    let object = runtime.heap.new_instance(&object_class, &*registry);

    let result = CallStack::new(runtime.clone()).invoke(locked, &[Value::Ref(object)]);
    assert_eq!(exception_name(&runtime, result), WellKnown::ArithmeticException.class_name());
    assert_eq!(monitors.enters.load(Ordering::SeqCst), 3);
    assert!(monitors.balanced());
    // nobody holds it any more
    assert!(monitors.try_enter(999, object));
}

#[test]
fn test_illegal_monitor_exit() {
    let registry = Arc::new(ClassRegistry::new());
    let mut class = ClassBuilder::new(MAIN);
    let mut a = Assembler::new();
    a.aload(0).op(MONITOREXIT).op(RETURN);
    class.method(method("unlock", "(Ljava/lang/Object;)V", STATIC, 1, 1, a));
    registry.define(class).unwrap();
    let unlock = find(&registry, MAIN, "unlock", "(Ljava/lang/Object;)V");

    let runtime = Arc::new(Runtime::new(registry.clone(), InterpreterConfig::default()));
    let object_class = registry.class(registry.well_known(WellKnown::Object));
    let object = runtime.heap.new_instance(&object_class, &*registry);
    let result = CallStack::new(runtime.clone()).invoke(unlock, &[Value::Ref(object)]);
    assert_eq!(
        exception_name(&runtime, result),
        WellKnown::IllegalMonitorStateException.class_name()
    );

    let result = CallStack::new(runtime.clone()).invoke(unlock, &[Value::Ref(ObjectRef::NULL)]);
    assert_eq!(exception_name(&runtime, result), WellKnown::NullPointerException.class_name());
}

#[test]
fn test_synchronized_counter_across_threads() {
    let registry = Arc::new(ClassRegistry::new());
    counter_class(&registry, true);
    let once = find(&registry, MAIN, "once", "()V");
    let runtime = Arc::new(Runtime::new(registry.clone(), InterpreterConfig::default()));

    thread::scope(|s| {
        for _ in 0..4 {
            let runtime = runtime.clone();
            s.spawn(move || {
                let mut stack = CallStack::new(runtime);
                for _ in 0..250 {
                    assert_eq!(stack.invoke(once, &[]), ExecutionResult::Returned(None));
                }
            });
        }
    });
    let count = static_field(&registry, MAIN, 0);
    assert_eq!(runtime.statics.get(&count), Value::Int(1000));
}

#[test]
fn test_thread_ids_are_distinct() {
    let registry = Arc::new(ClassRegistry::new());
    let runtime = Arc::new(Runtime::new(registry, InterpreterConfig::default()));
    let a = CallStack::new(runtime.clone());
    let b = CallStack::new(runtime);
    assert_ne!(a.thread_id(), b.thread_id());
    assert_ne!(a.thread_id(), 0);
}

extern "C" fn add_ints(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn scale(x: f32, y: f64) -> f64 {
    x as f64 * y
}

extern "C" fn low_byte(x: i32) -> i32 {
    x
}

fn native_class(registry: &ClassRegistry) {
    let mut class = ClassBuilder::new(MAIN);
    class.method(
        MethodBuilder::new("add", "(II)I", STATIC)
            .native(NativeBinding::Address(add_ints as usize)),
    );
    class.method(
        MethodBuilder::new("scale", "(FD)D", STATIC).native(NativeBinding::Address(scale as usize)),
    );
    class.method(
        MethodBuilder::new("lowByte", "(I)B", STATIC)
            .native(NativeBinding::Address(low_byte as usize)),
    );
    class.method(MethodBuilder::new("missing", "()V", STATIC).native(NativeBinding::Library {
        library: "libjvm-rs-test-missing.so".into(),
        symbol: "missing".into(),
    }));

    let add = class.method_ref(MAIN, "add", "(II)I");
    let scale = class.method_ref(MAIN, "scale", "(FD)D");
    let low_byte = class.method_ref(MAIN, "lowByte", "(I)B");
    let (x, y) = (class.float(1.5), class.double(4.0));

    let mut a = Assembler::new();
    a.iconst(40).iconst(2).invoke(INVOKESTATIC, add).op(IRETURN);
    class.method(method("callAdd", "()I", STATIC, 2, 0, a));

    let mut a = Assembler::new();
    a.ldc(x).ldc2(y).invoke(INVOKESTATIC, scale).op(DRETURN);
    class.method(method("callScale", "()D", STATIC, 3, 0, a));

    let mut a = Assembler::new();
    a.iconst(300).invoke(INVOKESTATIC, low_byte).op(IRETURN);
    class.method(method("callLowByte", "()I", STATIC, 1, 0, a));
    registry.define(class).unwrap();
}

#[test]
fn test_native_calls() {
    let registry = Arc::new(ClassRegistry::new());
    native_class(&registry);
    let runtime = Arc::new(Runtime::new(registry.clone(), InterpreterConfig::default()));
    let mut stack = CallStack::new(runtime.clone());

    let call_add = find(&registry, MAIN, "callAdd", "()I");
    assert_eq!(stack.invoke(call_add, &[]).returned(), Some(Value::Int(42)));

    let call_scale = find(&registry, MAIN, "callScale", "()D");
    assert_eq!(stack.invoke(call_scale, &[]).returned(), Some(Value::Double(6.0)));

    let call_low_byte = find(&registry, MAIN, "callLowByte", "()I");
    assert_eq!(stack.invoke(call_low_byte, &[]).returned(), Some(Value::Int(44)));

    // natives can be entered directly too
    let add = find(&registry, MAIN, "add", "(II)I");
    assert_eq!(
        stack.invoke(add, &[Value::Int(-1), Value::Int(-2)]).returned(),
        Some(Value::Int(-3))
    );
    assert_eq!(stack.depth(), 0);
    assert_eq!(runtime.metrics.native_calls.load(Ordering::Relaxed), 4);
}

#[test]
fn test_unsatisfied_link() {
    let registry = Arc::new(ClassRegistry::new());
    native_class(&registry);
    let runtime = Arc::new(Runtime::new(registry.clone(), InterpreterConfig::default()));
    let missing = find(&registry, MAIN, "missing", "()V");
    let mut stack = CallStack::new(runtime.clone());
    let result = stack.invoke(missing, &[]);
    assert_eq!(exception_name(&runtime, result), WellKnown::UnsatisfiedLinkError.class_name());
    assert_eq!(stack.depth(), 0);
}

struct RootRecorder(Mutex<Vec<Root>>);

impl SafepointHandler for RootRecorder {
    fn reached(&self, stack: &CallStack) {
        *self.0.lock() = stack.collect_roots();
    }
}

#[test]
fn test_root_enumeration() {
    let modes: [AddressingMode; 2] = [Uncompressed.into(), Compressed::default().into()];
    for addressing in modes {
        let registry = Arc::new(ClassRegistry::new());
        let mut class = ClassBuilder::new(MAIN);
        let mut a = Assembler::new();
        let next = a.label();
        a.aload(0).astore(1).aload(0).iconst(0).branch(IFEQ, next);
        a.bind(next).op(POP).op(RETURN);
        class.method(method(
            "hold",
            "(Ljava/lang/Object;)V",
            STATIC | AccessFlags::SYNCHRONIZED,
            2,
            2,
            a,
        ));
        registry.define(class).unwrap();
        let hold = find(&registry, MAIN, "hold", "(Ljava/lang/Object;)V");

        let recorder = Arc::new(RootRecorder(Mutex::new(vec![])));
        let config = InterpreterConfig {
            addressing,
            ..InterpreterConfig::default()
        };
        let runtime = Arc::new(
            Runtime::new(registry.clone(), config).with_safepoints(recorder.clone()),
        );
        let object_class = registry.class(registry.well_known(WellKnown::Object));
        let object = runtime.heap.new_instance(&object_class, &*registry);

        let result = CallStack::new(runtime.clone()).invoke(hold, &[Value::Ref(object)]);
        assert_eq!(result, ExecutionResult::Returned(None));

        let roots = recorder.0.lock().clone();
        let kinds: Vec<_> = roots
            .iter()
            .filter(|r| r.object == object)
            .map(|r| (r.kind, r.index))
            .collect();
        assert!(kinds.contains(&(RootKind::Local, 0)), "{addressing:?}: {roots:?}");
        assert!(kinds.contains(&(RootKind::Local, 1)), "{addressing:?}: {roots:?}");
        assert!(kinds.contains(&(RootKind::OperandStack, 0)), "{addressing:?}: {roots:?}");
        // the class mirror is the monitor of a static synchronized method
        assert!(roots.iter().any(|r| r.kind == RootKind::Monitor && r.object != object));
        assert!(roots.iter().all(|r| r.frame == Some(0)));
    }
}

#[test]
fn test_pending_exception_is_a_root() {
    let registry = Arc::new(ClassRegistry::new());
    let (outer, _) = catching_class(&registry, "java/lang/NullPointerException");
    let runtime = Arc::new(Runtime::new(registry, InterpreterConfig::default()));
    let mut stack = CallStack::new(runtime);
    let ExecutionResult::Threw(exception) = stack.invoke(outer, &[]) else {
        panic!("expected the exception to escape");
    };
    assert_eq!(
        stack.collect_roots(),
        vec![Root {
            frame: None,
            kind: RootKind::PendingException,
            index: 0,
            object: exception,
        }]
    );
}

#[test]
fn test_saved_arguments_are_roots() {
    for events in [EventMask::POP_FRAME, EventMask::empty()] {
        let registry = Arc::new(ClassRegistry::new());
        let mut class = ClassBuilder::new(MAIN);
        let object = class.class_ref(WellKnown::Object.class_name());
        let callee = class.method_ref(MAIN, "callee", "(Ljava/lang/Object;)V");

        // drops its only copy of the argument before reaching a safe point
        let mut a = Assembler::new();
        let next = a.label();
        a.op(ACONST_NULL).astore(0).iconst(0).branch(IFEQ, next);
        a.bind(next).op(RETURN);
        class.method(method("callee", "(Ljava/lang/Object;)V", STATIC, 1, 1, a));

        let mut a = Assembler::new();
        a.op_u2(NEW, object).invoke(INVOKESTATIC, callee).op(RETURN);
        class.method(method("caller", "()V", STATIC, 1, 0, a));
        registry.define(class).unwrap();
        let caller = find(&registry, MAIN, "caller", "()V");

        let recorder = Arc::new(RootRecorder(Mutex::new(vec![])));
        let config = InterpreterConfig {
            events,
            ..InterpreterConfig::default()
        };
        let runtime = Arc::new(
            Runtime::new(registry.clone(), config).with_safepoints(recorder.clone()),
        );
        let result = CallStack::new(runtime.clone()).invoke(caller, &[]);
        assert_eq!(result, ExecutionResult::Returned(None));

        let roots = recorder.0.lock().clone();
        if events.is_empty() {
            assert!(roots.is_empty(), "{roots:?}");
            continue;
        }
        assert_eq!(roots.len(), 1, "{roots:?}");
        let root = roots[0];
        assert_eq!((root.kind, root.index, root.frame), (RootKind::SavedArgument, 0, Some(1)));
        assert_eq!(
            runtime.heap.class_of(root.object),
            registry.well_known(WellKnown::Object)
        );
    }
}

/// What the top frame's operand stack looked like at the last safe point.
#[derive(Default)]
struct StackView(Mutex<Option<(usize, Tag, ObjectRef)>>);

impl SafepointHandler for StackView {
    fn reached(&self, stack: &CallStack) {
        let operands = &stack.current_frame().stack;
        *self.0.lock() = Some((operands.depth(), operands.tag(0), operands.peek_ref(0)));
    }
}

#[test]
fn test_handler_starts_with_only_the_exception() {
    let registry = Arc::new(ClassRegistry::new());
    let mut class = ClassBuilder::new(MAIN);
    let object = class.class_ref(WellKnown::Object.class_name());

    let mut a = Assembler::new();
    // a reference, a long and an int below the faulting arraylength
    a.op_u2(NEW, object).op(LCONST_1).iconst(5).op(ACONST_NULL).op(ARRAYLENGTH);
    let end = a.pc() as u16;
    let resume = a.label();
    a.iconst(0).branch(IFEQ, resume);
    a.bind(resume).op(ARETURN);
    class.method(
        MethodBuilder::new("guarded", "()Ljava/lang/Object;", STATIC)
            .code(6, 0, a.finish().unwrap())
            .handler(0, end, end, 0),
    );
    registry.define(class).unwrap();
    let guarded = find(&registry, MAIN, "guarded", "()Ljava/lang/Object;");

    let view = Arc::new(StackView::default());
    let runtime = Arc::new(
        Runtime::new(registry, InterpreterConfig::default()).with_safepoints(view.clone()),
    );
    let Some(Value::Ref(exception)) = CallStack::new(runtime.clone()).invoke(guarded, &[]).returned() else {
        panic!("the handler should return the exception");
    };
    assert_eq!(
        exception_name(&runtime, ExecutionResult::Threw(exception)),
        WellKnown::NullPointerException.class_name()
    );
    assert_eq!(*view.0.lock(), Some((1, Tag::Object, exception)));
}

#[test]
fn test_entry_call_with_null_receiver() {
    let registry = Arc::new(ClassRegistry::new());
    let mut class = ClassBuilder::new(MAIN);
    let mut a = Assembler::new();
    a.iconst(1).op(IRETURN);
    class.method(method(
        "get",
        "()I",
        AccessFlags::PUBLIC | AccessFlags::SYNCHRONIZED,
        1,
        1,
        a,
    ));
    registry.define(class).unwrap();
    let get = find(&registry, MAIN, "get", "()I");

    let monitors = Arc::new(CountingMonitors::new());
    let runtime = Arc::new(
        Runtime::new(registry, InterpreterConfig::default()).with_monitors(monitors.clone()),
    );
    let mut stack = CallStack::new(runtime.clone());
    let result = stack.invoke(get, &[Value::Ref(ObjectRef::NULL)]);
    assert_eq!(exception_name(&runtime, result), WellKnown::NullPointerException.class_name());
    assert_eq!(monitors.enters.load(Ordering::SeqCst), 0);
    assert_eq!(stack.depth(), 0);
}

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_foreign_monitor_exit_is_traced() {
    let registry = Arc::new(ClassRegistry::new());
    let mut class = ClassBuilder::new(MAIN);
    let inner = class.method_ref(MAIN, "inner", "(Ljava/lang/Object;)V");

    let mut a = Assembler::new();
    a.aload(0).op(MONITOREXIT).op(RETURN);
    class.method(method("inner", "(Ljava/lang/Object;)V", STATIC, 1, 1, a));

    // enters here, exits in inner
    let mut a = Assembler::new();
    a.aload(0).op(MONITORENTER).aload(0).invoke(INVOKESTATIC, inner).op(RETURN);
    class.method(method("outer", "(Ljava/lang/Object;)V", STATIC, 1, 1, a));
    registry.define(class).unwrap();
    let outer = find(&registry, MAIN, "outer", "(Ljava/lang/Object;)V");

    let monitors = Arc::new(CountingMonitors::new());
    let runtime = Arc::new(
        Runtime::new(registry.clone(), InterpreterConfig::default()).with_monitors(monitors.clone()),
    );
    let object_class = registry.class(registry.well_known(WellKnown::Object));
    let object = runtime.heap.new_instance(&object_class, &*registry);

    let sink = Sink::default();
    let mut stack = CallStack::with_tracer(runtime.clone(), Tracer::to_writer(Box::new(sink.clone())));
    assert_eq!(stack.invoke(outer, &[Value::Ref(object)]), ExecutionResult::Returned(None));
    drop(stack);

    let trace = String::from_utf8(sink.0.lock().clone()).unwrap();
    assert!(trace.contains("exited but not entered by this frame"), "{trace}");
    assert!(monitors.balanced());
    assert!(monitors.try_enter(999, object));
}

#[test]
fn test_stop_the_world() {
    let registry = Arc::new(ClassRegistry::new());
    let mut class = ClassBuilder::new(MAIN);
    class.field("stop", "I", AccessFlags::STATIC);
    let stop = class.field_ref(MAIN, "stop", "I");
    let mut a = Assembler::new();
    let top = a.here();
    a.op_u2(GETSTATIC, stop).branch(IFEQ, top).op(RETURN);
    class.method(method("spin", "(Ljava/lang/Object;)V", STATIC, 1, 1, a));
    registry.define(class).unwrap();
    let spin = find(&registry, MAIN, "spin", "(Ljava/lang/Object;)V");

    let world = Arc::new(StopTheWorld::new(Arc::new(Default::default())));
    let runtime = Arc::new(
        Runtime::new(registry.clone(), InterpreterConfig::default()).with_safepoints(world.clone()),
    );
    let object_class = registry.class(registry.well_known(WellKnown::Object));
    let objects: Vec<_> = (0..2)
        .map(|_| runtime.heap.new_instance(&object_class, &*registry))
        .collect();
    let stop = static_field(&registry, MAIN, 0);

    thread::scope(|s| {
        for object in &objects {
            let runtime = runtime.clone();
            let arg = Value::Ref(*object);
            s.spawn(move || CallStack::new(runtime).invoke(spin, &[arg]));
        }

        let guard = world.stop(2, Duration::from_secs(10)).expect("threads should park");
        assert_eq!(world.parked(), 2);
        let roots = guard.roots();
        // each spinning frame holds its argument and nothing else
        assert_eq!(roots.len(), 2, "{roots:?}");
        assert_ne!(roots[0].0, roots[1].0);
        for (_, root) in &roots {
            assert_eq!((root.kind, root.index, root.frame), (RootKind::Local, 0, Some(0)));
            assert!(objects.contains(&root.object));
        }
        runtime.statics.set(&stop, Value::Int(1));
        drop(guard);
    });
    assert!(!world.is_requested());
    assert_eq!(world.parked(), 0);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    pops_left: AtomicUsize,
    exception_catch: Mutex<Option<Location>>,
}

impl Recorder {
    fn log(&self, event: String) {
        self.events.lock().push(event);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl DebugHooks for Recorder {
    fn method_entry(&self, _thread: ThreadId, method: &MethodDescription) {
        self.log(format!("enter {}", method.name));
    }

    fn method_exit(
        &self,
        _thread: ThreadId,
        method: &MethodDescription,
        result: Option<Value>,
        exception: Option<ObjectRef>,
    ) {
        self.log(format!("exit {} {:?} {}", method.name, result, exception.is_some()));
    }

    fn field_access(&self, _thread: ThreadId, _location: Location, field: &FieldDescription, _object: Option<ObjectRef>) {
        self.log(format!("read {}", field.name));
    }

    fn field_modification(
        &self,
        _thread: ThreadId,
        _location: Location,
        field: &FieldDescription,
        _object: Option<ObjectRef>,
        value: Value,
    ) {
        self.log(format!("write {} {:?}", field.name, value));
    }

    fn exception(&self, _thread: ThreadId, location: Location, _exception: ObjectRef, catch: Option<Location>) {
        self.log(format!("throw at {} caught at {:?}", location.pc, catch.map(|c| c.pc)));
        *self.exception_catch.lock() = catch;
    }

    fn exception_catch(&self, _thread: ThreadId, location: Location, _exception: ObjectRef) {
        self.log(format!("catch at {}", location.pc));
    }

    fn breakpoint(&self, _thread: ThreadId, frame: &Frame) -> Option<u8> {
        self.log(format!("breakpoint at {}", frame.pc));
        Some(ICONST_2)
    }

    fn pop_frame_requested(&self, _thread: ThreadId, frame: &Frame) -> bool {
        // after the putstatic in bump()
        if frame.method.name == "bump" && frame.pc == 8 {
            return self
                .pops_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        }
        false
    }
}

fn with_hooks(registry: Arc<ClassRegistry>, events: EventMask) -> (Arc<Runtime>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let config = InterpreterConfig {
        events,
        ..InterpreterConfig::default()
    };
    let runtime = Arc::new(Runtime::new(registry, config).with_hooks(recorder.clone()));
    (runtime, recorder)
}

#[test]
fn test_method_entry_and_exit_events() {
    let registry = Arc::new(ClassRegistry::new());
    counter_class(&registry, false);
    let twice = find(&registry, MAIN, "twice", "()I");
    let (runtime, recorder) = with_hooks(registry, EventMask::METHOD_ENTRY | EventMask::METHOD_EXIT);

    assert_eq!(CallStack::new(runtime).invoke(twice, &[]).returned(), Some(Value::Int(2)));
    assert_eq!(
        recorder.take(),
        [
            "enter twice",
            "enter bump",
            "exit bump None false",
            "enter bump",
            "exit bump None false",
            "exit twice Some(Int(2)) false",
        ]
    );
}

#[test]
fn test_field_events() {
    let registry = Arc::new(ClassRegistry::new());
    counter_class(&registry, false);
    let once = find(&registry, MAIN, "once", "()V");
    let (runtime, recorder) =
        with_hooks(registry, EventMask::FIELD_ACCESS | EventMask::FIELD_MODIFICATION);

    CallStack::new(runtime).invoke(once, &[]);
    assert_eq!(recorder.take(), ["read count", "write count Int(1)"]);
}

#[test]
fn test_exception_events() {
    let registry = Arc::new(ClassRegistry::new());
    let (outer, inner) = catching_class(&registry, "java/lang/ArithmeticException");
    let (runtime, recorder) = with_hooks(
        registry,
        EventMask::EXCEPTION | EventMask::EXCEPTION_CATCH | EventMask::METHOD_EXIT,
    );

    assert_eq!(CallStack::new(runtime).invoke(outer, &[]).returned(), Some(Value::Int(-1)));
    // reported once, at the idiv, with the handler in outer
    assert_eq!(
        recorder.take(),
        [
            "throw at 2 caught at Some(4)",
            "exit inner None true",
            "catch at 4",
            "exit outer Some(Int(-1)) false",
        ]
    );
    assert_eq!(
        *recorder.exception_catch.lock(),
        Some(Location { method: outer, pc: 4 })
    );
    assert_ne!(outer, inner);
}

#[test]
fn test_breakpoint_runs_original_instruction() {
    let registry = Arc::new(ClassRegistry::new());
    let mut class = ClassBuilder::new(MAIN);
    class.method(
        MethodBuilder::new("test", "()I", STATIC)
            .code(2, 0, vec![BREAKPOINT, ICONST_3, IADD, IRETURN]),
    );
    registry.define(class).unwrap();
    let test = find(&registry, MAIN, "test", "()I");
    let (runtime, recorder) = with_hooks(registry, EventMask::BREAKPOINT);

    assert_eq!(CallStack::new(runtime).invoke(test, &[]).returned(), Some(Value::Int(5)));
    assert_eq!(recorder.take(), ["breakpoint at 0"]);
}

#[test]
fn test_single_step() {
    struct Steps(AtomicUsize);
    impl DebugHooks for Steps {
        fn single_step(&self, _thread: ThreadId, _frame: &Frame) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let registry = Arc::new(ClassRegistry::new());
    counter_class(&registry, false);
    let twice = find(&registry, MAIN, "twice", "()I");
    let steps = Arc::new(Steps(AtomicUsize::new(0)));
    let config = InterpreterConfig {
        events: EventMask::SINGLE_STEP,
        ..InterpreterConfig::default()
    };
    let runtime = Arc::new(Runtime::new(registry, config).with_hooks(steps.clone()));
    CallStack::new(runtime).invoke(twice, &[]);
    // twice: 4 instructions, bump: 5 instructions each
    assert_eq!(steps.0.load(Ordering::SeqCst), 4 + 2 * 5);
}

#[test]
fn test_pop_frame_reexecutes_call() {
    let registry = Arc::new(ClassRegistry::new());
    counter_class(&registry, true);
    let twice = find(&registry, MAIN, "twice", "()I");
    let monitors = Arc::new(CountingMonitors::new());
    let (runtime, recorder) = {
        let recorder = Arc::new(Recorder::default());
        recorder.pops_left.store(1, Ordering::SeqCst);
        let config = InterpreterConfig {
            events: EventMask::POP_FRAME | EventMask::METHOD_EXIT,
            ..InterpreterConfig::default()
        };
        let runtime = Runtime::new(registry, config)
            .with_hooks(recorder.clone())
            .with_monitors(monitors.clone());
        (Arc::new(runtime), recorder)
    };

    // the popped bump() had already written the counter, and runs again
    let mut stack = CallStack::new(runtime);
    assert_eq!(stack.invoke(twice, &[]).returned(), Some(Value::Int(3)));
    assert!(monitors.balanced());
    // popped frames report no exit
    assert_eq!(
        recorder.take(),
        [
            "exit bump None false",
            "exit bump None false",
            "exit twice Some(Int(3)) false",
        ]
    );
}

#[test]
fn test_entry_frames_cannot_be_popped() {
    struct Greedy;
    impl DebugHooks for Greedy {
        fn pop_frame_requested(&self, _thread: ThreadId, _frame: &Frame) -> bool {
            true
        }
    }

    let registry = Arc::new(ClassRegistry::new());
    counter_class(&registry, false);
    let bump = find(&registry, MAIN, "bump", "()V");
    let config = InterpreterConfig {
        events: EventMask::POP_FRAME,
        ..InterpreterConfig::default()
    };
    let runtime = Arc::new(Runtime::new(registry.clone(), config).with_hooks(Arc::new(Greedy)));
    assert_eq!(
        CallStack::new(runtime.clone()).invoke(bump, &[]),
        ExecutionResult::Returned(None)
    );
    assert_eq!(runtime.statics.get(&static_field(&registry, MAIN, 0)), Value::Int(1));
}

#[test]
fn test_frame_pop_listener() {
    struct Listener(Mutex<Vec<(String, bool)>>);
    impl FramePopListener for Listener {
        fn frame_popped(&self, _thread: ThreadId, method: &MethodDescription, by_exception: bool) {
            self.0.lock().push((method.name.clone(), by_exception));
        }
    }

    let registry = Arc::new(ClassRegistry::new());
    let (outer, inner) = catching_class(&registry, "java/lang/ArithmeticException");
    let config = InterpreterConfig {
        events: EventMask::FRAME_POP,
        ..InterpreterConfig::default()
    };
    let runtime = Arc::new(Runtime::new(registry, config));
    let listener = Arc::new(Listener(Mutex::new(vec![])));
    runtime.add_frame_pop_listener(inner, listener.clone());

    CallStack::new(runtime.clone()).invoke(outer, &[]);
    CallStack::new(runtime).invoke(inner, &[]);
    assert_eq!(
        *listener.0.lock(),
        [("inner".to_string(), true), ("inner".to_string(), true)]
    );
}

#[test]
fn test_constants_are_global_roots() {
    let registry = Arc::new(ClassRegistry::new());
    let mut class = ClassBuilder::new(MAIN);
    let greeting = class.string("hello");
    let mut a = Assembler::new();
    a.ldc(greeting).op(ARETURN);
    class.method(method("greet", "()Ljava/lang/String;", STATIC, 1, 0, a));
    registry.define(class).unwrap();
    let greet = find(&registry, MAIN, "greet", "()Ljava/lang/String;");

    let runtime = Arc::new(Runtime::new(registry, InterpreterConfig::default()));
    let Some(Value::Ref(string)) = CallStack::new(runtime.clone()).invoke(greet, &[]).returned() else {
        panic!("expected a string");
    };
    assert_eq!(runtime.heap.string_value(string).as_deref(), Some("hello"));
    assert!(runtime.global_roots().contains(&string));
}

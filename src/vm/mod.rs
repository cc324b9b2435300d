use crate::{
    resolve::Resolver,
    types::MethodId,
    value::{object::Heap, storage::StaticStorage, AddressingMode, ObjectRef, Value},
};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

#[macro_use]
mod macros;
mod calls;
pub mod debug;
mod evaluation_stack;
mod exceptions;
pub mod frame;
pub mod gc;
mod instructions;
pub mod metrics;
pub mod opcodes;
pub mod pinvoke;
mod stack;
pub mod sync;
pub mod threading;
pub mod tracer;

pub use debug::{DebugHooks, EventMask, FramePopListener, Location};
pub use evaluation_stack::{Locals, OperandStack};
pub use frame::{Frame, FramePopState, MonitorList};
pub use gc::{Root, RootKind};
pub use metrics::RuntimeMetrics;
pub use pinvoke::{FfiInvoker, NativeInvoker};
pub use stack::CallStack;
pub use sync::{SyncBlockManager, Synchronizer, ThreadId};
pub use threading::{NoSafepoints, SafepointHandler, StopTheWorld};

/// Read-only interpreter settings, fixed when the [`Runtime`] is built.
#[derive(Clone, Debug)]
pub struct InterpreterConfig {
    /// How references are encoded in stack and local slots.
    pub addressing: AddressingMode,
    /// Tool notifications the interpreter reports.
    pub events: EventMask,
    /// Per-thread budget of frame slots.
    pub stack_slots: usize,
    /// Headroom below which a new frame raises `StackOverflowError`.
    pub stack_guard: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            addressing: AddressingMode::default(),
            events: EventMask::empty(),
            stack_slots: 1 << 18,
            stack_guard: 1 << 10,
        }
    }
}

/// Outcome of a top-level [`CallStack::invoke`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExecutionResult {
    Returned(Option<Value>),
    /// An exception escaped the entry frame. It stays pending on the
    /// call stack until taken.
    Threw(ObjectRef),
}

impl ExecutionResult {
    pub fn returned(self) -> Option<Value> {
        match self {
            ExecutionResult::Returned(v) => v,
            ExecutionResult::Threw(e) => panic!("expected a normal return, got exception {e:?}"),
        }
    }
}

/// What the top frame did during one [`CallStack::step`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepResult {
    Continue,
    /// A return instruction ran; the frame has not been torn down yet.
    Returned(Option<Value>),
    /// An exception is pending on the call stack.
    Exception,
    /// The frame was asked to pop itself.
    Popped,
}

/// State shared by every interpreter thread: the collaborators the core
/// calls out to, the heap, static storage and configuration.
pub struct Runtime {
    pub resolver: Arc<dyn Resolver>,
    pub heap: Heap,
    pub statics: StaticStorage,
    pub monitors: Arc<dyn Synchronizer>,
    pub natives: Arc<dyn NativeInvoker>,
    pub hooks: Option<Arc<dyn DebugHooks>>,
    pub safepoints: Arc<dyn SafepointHandler>,
    pub config: InterpreterConfig,
    pub metrics: Arc<RuntimeMetrics>,
    shutting_down: AtomicBool,
    next_thread_id: AtomicU64,
    frame_pop_listeners: RwLock<Vec<(MethodId, Arc<dyn FramePopListener>)>>,
}

impl Runtime {
    pub fn new(resolver: Arc<dyn Resolver>, config: InterpreterConfig) -> Self {
        let metrics = Arc::new(RuntimeMetrics::new());
        Self {
            resolver,
            heap: Heap::new(),
            statics: StaticStorage::new(),
            monitors: Arc::new(SyncBlockManager::new(metrics.clone())),
            natives: Arc::new(FfiInvoker::new()),
            hooks: None,
            safepoints: Arc::new(NoSafepoints),
            config,
            metrics,
            shutting_down: AtomicBool::new(false),
            next_thread_id: AtomicU64::new(1),
            frame_pop_listeners: RwLock::new(vec![]),
        }
    }

    pub fn with_monitors(mut self, monitors: Arc<dyn Synchronizer>) -> Self {
        self.monitors = monitors;
        self
    }

    pub fn with_natives(mut self, natives: Arc<dyn NativeInvoker>) -> Self {
        self.natives = natives;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn DebugHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_safepoints(mut self, safepoints: Arc<dyn SafepointHandler>) -> Self {
        self.safepoints = safepoints;
        self
    }

    /// Switches exception search to `finally`-style handlers only, so frames
    /// still release their monitors without resolving more classes.
    pub fn begin_shutdown(&self) {
        tracing::info!("runtime entering shutdown");
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn allocate_thread_id(&self) -> ThreadId {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Notifies `listener` whenever a frame of `method` is torn down.
    pub fn add_frame_pop_listener(&self, method: MethodId, listener: Arc<dyn FramePopListener>) {
        self.frame_pop_listeners.write().push((method, listener));
    }

    pub(crate) fn frame_pop_listeners_for(&self, method: MethodId) -> Vec<Arc<dyn FramePopListener>> {
        self.frame_pop_listeners
            .read()
            .iter()
            .filter(|(m, _)| *m == method)
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// References reachable without any thread: static fields, interned
    /// strings and class mirrors.
    pub fn global_roots(&self) -> Vec<ObjectRef> {
        let mut roots = self.statics.references();
        roots.extend(self.heap.permanent_roots());
        roots
    }
}

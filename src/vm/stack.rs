use crate::{
    resolve::Resolver,
    types::{MethodId, WellKnown},
    value::{ObjectRef, Value},
    vm::{
        calls::{CallSite, Invocation},
        tracer::Tracer,
        ExecutionResult, Frame, Runtime, StepResult, ThreadId,
    },
};
use std::{cell::Cell, sync::Arc};

/// One interpreter thread: its frame chain and the thread-local state the
/// dispatch loop needs.
pub struct CallStack {
    pub runtime: Arc<Runtime>,
    pub(crate) frames: Vec<Frame>,
    thread_id: ThreadId,
    pub(crate) pending: Option<ObjectRef>,
    pub(crate) overflow_latched: bool,
    pub(crate) slots_in_use: usize,
    suspendable: Cell<bool>,
    tracer: Tracer,
}

impl CallStack {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self::with_tracer(runtime, Tracer::new())
    }

    pub fn with_tracer(runtime: Arc<Runtime>, tracer: Tracer) -> Self {
        let thread_id = runtime.allocate_thread_id();
        Self {
            runtime,
            frames: vec![],
            thread_id,
            pending: None,
            overflow_latched: false,
            slots_in_use: 0,
            suspendable: Cell::new(true),
            tracer,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    pub fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots_in_use
    }

    pub fn tracer_enabled(&self) -> bool {
        self.tracer.is_enabled()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn indent(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    pub fn trace_dump_frames(&self) {
        self.tracer.dump_frames(&self.frame_summaries());
    }

    fn frame_summaries(&self) -> Vec<(String, Vec<String>)> {
        self.frames
            .iter()
            .rev()
            .map(|f| (f.describe(), f.stack.describe()))
            .collect()
    }

    pub fn pending_exception(&self) -> Option<ObjectRef> {
        self.pending
    }

    pub fn take_pending_exception(&mut self) -> Option<ObjectRef> {
        self.pending.take()
    }

    /// False while the resolver runs, so safe points reached from inside a
    /// resolution do not park this thread.
    pub fn is_suspendable(&self) -> bool {
        self.suspendable.get()
    }

    pub(crate) fn resolving<T>(&self, f: impl FnOnce(&dyn Resolver) -> T) -> T {
        let previous = self.suspendable.replace(false);
        let result = f(&*self.runtime.resolver);
        self.suspendable.set(previous);
        result
    }

    pub(crate) fn safepoint(&self) {
        if !self.is_suspendable() {
            return;
        }
        if let Some(frame) = self.frames.last() {
            vm_trace_safepoint!(self, frame.pc);
        }
        let handler = self.runtime.safepoints.clone();
        handler.reached(self);
    }

    /// Runs `method` with `args` (receiver first for instance methods) to
    /// completion on this thread.
    pub fn invoke(&mut self, method: MethodId, args: &[Value]) -> ExecutionResult {
        let method = self.runtime.resolver.method(method);
        let base = self.frames.len();
        vm_msg!(self, "-- entering {:?} with {:?} --", method, args);

        if !method.is_static() && matches!(args.first(), Some(Value::Ref(r)) if r.is_null()) {
            self.raise(
                WellKnown::NullPointerException,
                Some(format!("Cannot invoke \"{method:?}\" on a null reference")),
            );
            return self.entry_threw();
        }

        match self.call(method, CallSite::Entry(args)) {
            Invocation::Pushed => {}
            Invocation::Completed(value) => return ExecutionResult::Returned(value),
            Invocation::Raised => return self.entry_threw(),
        }

        loop {
            match self.step() {
                StepResult::Continue => {}
                StepResult::Returned(value) => {
                    let entry = self.frames.len() == base + 1;
                    let value = self.complete_return(value);
                    if entry {
                        return ExecutionResult::Returned(value);
                    }
                }
                StepResult::Exception => loop {
                    if self.dispatch_exception(base) {
                        break;
                    }
                    if self.frames.len() == base {
                        return self.entry_threw();
                    }
                },
                StepResult::Popped => self.finish_pop(),
            }
        }
    }

    /// An exception left the entry frame. Once no frames remain, the unwind
    /// is over and a later overflow must be raised again.
    fn entry_threw(&mut self) -> ExecutionResult {
        if self.frames.is_empty() {
            self.overflow_latched = false;
        }
        ExecutionResult::Threw(self.expect_pending())
    }

    fn expect_pending(&self) -> ObjectRef {
        match self.pending {
            Some(e) => e,
            None => self.fatal("exception path taken with nothing pending"),
        }
    }

    /// Reports an internal invariant violation and aborts the thread.
    pub fn fatal(&self, message: &str) -> ! {
        let frames = self.frame_summaries();
        tracing::error!(thread = self.thread_id, "fatal interpreter error: {message}");
        eprintln!("fatal interpreter error on thread {}: {message}", self.thread_id);
        for (frame, stack) in &frames {
            eprintln!("  at {frame}");
            for slot in stack {
                eprintln!("      {slot}");
            }
        }
        self.tracer.dump_frames(&frames);
        self.tracer.flush();
        panic!("fatal interpreter error: {message}");
    }
}

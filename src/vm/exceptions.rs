use crate::{
    error::ResolutionError,
    types::{HandlerEntry, WellKnown},
    value::ObjectRef,
    vm::{CallStack, EventMask, Location, StepResult},
};

/// How a guest exception moves through the call stack.
///
/// Raising only records the exception as pending on the thread. The dispatch
/// loop then hands control to [`CallStack::dispatch_exception`], which works
/// on the top frame alone:
/// 1. **Notify**: if enabled, tools hear about the exception once, together
///    with the location that will eventually catch it.
/// 2. **Search**: the frame's handler table is scanned in declaration order.
/// 3. **Transfer** or **Unwind**: a matching handler gets an operand stack
///    holding only the exception; otherwise the frame releases its monitors,
///    is torn down, and the exception becomes pending in the caller.
impl CallStack {
    /// Allocates an exception of class `class` and makes it pending.
    pub(crate) fn raise(&mut self, class: WellKnown, message: Option<String>) -> StepResult {
        let runtime = self.runtime.clone();
        let class_id = runtime.resolver.well_known(class);
        let description = runtime.resolver.class(class_id);
        let exception = runtime.heap.new_instance(&description, &*runtime.resolver);
        runtime.heap.set_message(exception, message.clone());
        runtime.metrics.record_exception();
        vm_msg!(
            self,
            "-- raising {} ({}) --",
            description,
            message.as_deref().unwrap_or("no message")
        );
        self.pending = Some(exception);
        StepResult::Exception
    }

    pub(crate) fn raise_resolution(&mut self, error: ResolutionError) -> StepResult {
        tracing::debug!(%error, "resolution failed");
        self.raise(error.exception_class(), Some(error.to_string()))
    }

    /// `athrow`: makes an existing object the pending exception.
    pub(crate) fn throw(&mut self, exception: ObjectRef) -> StepResult {
        if exception.is_null() {
            return self.raise(WellKnown::NullPointerException, Some("Cannot throw null".into()));
        }
        self.runtime.metrics.record_exception();
        self.pending = Some(exception);
        StepResult::Exception
    }

    /// First handler of frame `index` that covers its pc and catches
    /// `exception`.
    ///
    /// Catch types that fail to resolve never match. During shutdown only
    /// catch-all handlers are considered.
    pub fn find_handler(&self, index: usize, exception: ObjectRef) -> Option<HandlerEntry> {
        let frame = &self.frames[index];
        let code = frame.method.code.as_ref()?;
        let exception_class = self.runtime.heap.class_of(exception);
        let shutting_down = self.runtime.is_shutting_down();

        code.handlers.iter().copied().find(|h| {
            if !h.covers(frame.pc) {
                return false;
            }
            if h.catches_everything() {
                return true;
            }
            if shutting_down {
                return false;
            }
            self.resolving(|r| match r.resolve_class(frame.method.class, h.catch_type) {
                Ok(catch_class) => r.is_assignable(exception_class, catch_class),
                Err(_) => false,
            })
        })
    }

    /// Where `exception` would be caught if it propagated from the top frame
    /// now. Native frames are skipped. Nothing is modified.
    pub fn find_eventual_catcher(&self, exception: ObjectRef) -> Option<Location> {
        let mut cursor = self.frames.len().checked_sub(1);
        while let Some(index) = cursor {
            let frame = &self.frames[index];
            if !frame.is_native() {
                if let Some(handler) = self.find_handler(index, exception) {
                    return Some(Location {
                        method: frame.method.id,
                        pc: handler.handler_pc as usize,
                    });
                }
            }
            cursor = frame.caller;
        }
        None
    }

    /// Handles the pending exception in the top frame. Returns true if a
    /// handler there took it; otherwise the frame has been torn down and the
    /// exception is pending again, now for the caller.
    pub(crate) fn dispatch_exception(&mut self, base: usize) -> bool {
        let Some(exception) = self.pending.take() else {
            self.fatal("exception dispatch without a pending exception");
        };
        let runtime = self.runtime.clone();
        let events = runtime.config.events;
        let thread = self.thread_id();
        let index = self.frames.len() - 1;
        self.frames[index].thrown = exception;

        let location = Location::of(&self.frames[index]);
        vm_trace_exception!(self, exception, location);

        if events.contains(EventMask::EXCEPTION) && self.frames[index].reported != exception {
            let catch = self.find_eventual_catcher(exception);
            if let Some(hooks) = &runtime.hooks {
                hooks.exception(thread, location, exception, catch);
            }
            self.frames[index].reported = exception;
        }

        let handler = if self.frames[index].is_native() {
            None
        } else {
            self.find_handler(index, exception)
        };

        match handler {
            Some(handler) => {
                let frame = &mut self.frames[index];
                frame.stack.clear();
                frame.stack.push_ref(exception);
                frame.pc = handler.handler_pc as usize;
                frame.thrown = ObjectRef::NULL;
                frame.reported = ObjectRef::NULL;
                self.overflow_latched = false;

                if events.contains(EventMask::EXCEPTION_CATCH) {
                    if let Some(hooks) = &runtime.hooks {
                        hooks.exception_catch(thread, Location::of(&self.frames[index]), exception);
                    }
                }
                vm_msg!(self, "-- caught {:?} at {} --", exception, handler.handler_pc);
                true
            }
            None => {
                vm_trace_stack_snapshot!(self);
                self.teardown(None, Some(exception));
                if self.frames.len() > base {
                    self.current_frame_mut().reported = exception;
                }
                self.pending = Some(exception);
                false
            }
        }
    }
}

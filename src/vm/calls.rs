use crate::{
    types::{BasicType, MethodDescription, WellKnown},
    value::{ObjectRef, Slot, Tag, Value},
    vm::{
        frame::FRAME_OVERHEAD, CallStack, EventMask, Frame, FramePopState, StepResult,
    },
};
use std::sync::Arc;

/// Where the arguments of a call come from.
#[derive(Clone, Copy)]
pub(crate) enum CallSite<'a> {
    /// The caller's operand stack, from an invoke instruction of this length.
    Bytecode(usize),
    /// The embedder, through [`CallStack::invoke`].
    Entry(&'a [Value]),
}

pub(crate) enum Invocation {
    /// A new frame is on top of the stack.
    Pushed,
    /// The call ran to completion without a frame of its own (natives).
    Completed(Option<Value>),
    /// An exception is pending.
    Raised,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InvokeKind {
    Static,
    Special,
    Virtual,
    Interface,
}

impl From<Invocation> for StepResult {
    fn from(value: Invocation) -> Self {
        match value {
            Invocation::Pushed | Invocation::Completed(_) => StepResult::Continue,
            Invocation::Raised => StepResult::Exception,
        }
    }
}

impl CallStack {
    /// Executes an invoke instruction of the top frame whose method
    /// reference is constant-pool entry `index`.
    pub(crate) fn invoke_instruction(&mut self, kind: InvokeKind, index: u16, length: usize) -> StepResult {
        let container = self.current_frame().method.class;
        let resolved = match self.resolving(|r| r.resolve_method(container, index)) {
            Ok(m) => self.runtime.resolver.method(m),
            Err(e) => return self.raise_resolution(e),
        };

        if (kind == InvokeKind::Static) != resolved.is_static() {
            let expected = if kind == InvokeKind::Static { "static" } else { "non-static" };
            let class = self.runtime.resolver.class(resolved.class);
            return self.raise(
                WellKnown::IncompatibleClassChangeError,
                Some(format!("Expected {expected} method {class}.{resolved:?}")),
            );
        }

        let target = if kind == InvokeKind::Static {
            resolved
        } else {
            let receiver = self.current_frame().stack.peek_ref(resolved.argument_slots() - 1);
            if receiver.is_null() {
                return self.raise(
                    WellKnown::NullPointerException,
                    Some(format!("Cannot invoke \"{:?}\" on a null reference", resolved)),
                );
            }
            match self.select_target(kind, resolved, receiver) {
                Ok(m) => m,
                Err(result) => return result,
            }
        };

        self.call(target, CallSite::Bytecode(length)).into()
    }

    fn select_target(
        &mut self,
        kind: InvokeKind,
        resolved: Arc<MethodDescription>,
        receiver: ObjectRef,
    ) -> Result<Arc<MethodDescription>, StepResult> {
        let resolver = self.runtime.resolver.clone();
        let runtime_class = resolver.class(self.runtime.heap.class_of(receiver));
        match kind {
            InvokeKind::Static | InvokeKind::Special => Ok(resolved),
            InvokeKind::Virtual => {
                let target = match resolved.vtable_index {
                    Some(slot) => resolver.method(runtime_class.vtable[slot]),
                    None => resolved,
                };
                if target.is_abstract() {
                    return Err(self.raise(
                        WellKnown::AbstractMethodError,
                        Some(format!("{runtime_class}.{target:?}")),
                    ));
                }
                Ok(target)
            }
            InvokeKind::Interface => {
                let interface = resolver.class(resolved.class);
                if !resolver.is_assignable(runtime_class.id, interface.id) {
                    return Err(self.raise(
                        WellKnown::IncompatibleClassChangeError,
                        Some(format!(
                            "Class {runtime_class} does not implement the requested interface {interface}"
                        )),
                    ));
                }
                let found = resolver
                    .find_method(runtime_class.id, &resolved.name, &resolved.descriptor)
                    .map(|m| resolver.method(m));
                match found {
                    Some(m) if !m.is_abstract() => {
                        if !m.is_public() {
                            return Err(self.raise(
                                WellKnown::IllegalAccessError,
                                Some(format!("{runtime_class}.{m:?} is not public")),
                            ));
                        }
                        Ok(m)
                    }
                    _ => Err(self.raise(
                        WellKnown::AbstractMethodError,
                        Some(format!("Receiver class {runtime_class} does not define {resolved:?}")),
                    )),
                }
            }
        }
    }

    /// Builds the frame for `method` and makes it the top frame, or runs it
    /// across the native boundary.
    pub(crate) fn call(&mut self, method: Arc<MethodDescription>, site: CallSite) -> Invocation {
        if method.is_native() {
            return self.call_native(method, site);
        }
        if method.is_abstract() {
            self.raise(WellKnown::AbstractMethodError, Some(format!("{method:?}")));
            return Invocation::Raised;
        }
        let Some(code) = method.code.as_ref() else {
            self.fatal(&format!("{method:?} has no code"));
        };

        let cost = Frame::cost(code);
        if !self.reserve(cost) {
            return Invocation::Raised;
        }

        let config = &self.runtime.config;
        let codec = config.addressing;
        let pop_enabled = config.events.contains(EventMask::POP_FRAME);
        let caller = self.frames.len().checked_sub(1);
        let mut frame = Frame::interpreted(method.clone(), code, codec, caller);

        let arg_slots = method.argument_slots();
        assert!(
            arg_slots <= frame.locals.len(),
            "{method:?} takes {arg_slots} argument slots but has {} locals",
            frame.locals.len()
        );
        match site {
            CallSite::Bytecode(length) => {
                let Some(caller) = self.frames.last_mut() else {
                    unreachable!("bytecode call site without a caller")
                };
                let (slots, tags) = caller.stack.window(arg_slots);
                let mut i = 0;
                if !method.is_static() {
                    frame.locals.set(0, slots[0], tags[0]);
                    i = 1;
                }
                for param in &method.signature.parameters {
                    if param.is_wide() {
                        // the stack keeps the high word deeper, locals keep it second
                        frame.locals.set(i, slots[i + 1], Tag::None);
                        frame.locals.set(i + 1, slots[i], Tag::None);
                        i += 2;
                    } else {
                        frame.locals.set(i, slots[i], tags[i]);
                        i += 1;
                    }
                }
                if pop_enabled {
                    frame.saved_args = Some(slots.iter().copied().zip(tags.iter().copied()).collect());
                    frame.pop_state = FramePopState::Available;
                }
                caller.stack.pop_clear_ref(arg_slots);
                frame.call_length = length;
            }
            CallSite::Entry(args) => {
                let given: usize = args.iter().map(Value::slot_count).sum();
                assert_eq!(given, arg_slots, "wrong argument count for {method:?}");
                let mut i = 0;
                for arg in args {
                    frame.locals.set_value(i, *arg);
                    i += arg.slot_count();
                }
                frame.entry = true;
            }
        }
        if !method.is_static() {
            frame.this = frame.locals.get_ref(0);
        }
        if config.events.contains(EventMask::FRAME_POP) {
            frame.pop_listeners = self.runtime.frame_pop_listeners_for(method.id);
        }

        self.frames.push(frame);
        self.slots_in_use += cost;
        self.enter_method(&method);
        Invocation::Pushed
    }

    /// Checks headroom for a frame of `cost` slots. Raises
    /// `StackOverflowError` once when the guard zone is reached.
    fn reserve(&mut self, cost: usize) -> bool {
        let config = &self.runtime.config;
        let remaining = config.stack_slots.saturating_sub(self.slots_in_use);
        if remaining < cost + config.stack_guard && !self.overflow_latched {
            self.overflow_latched = true;
            tracing::warn!(
                thread = self.thread_id(),
                depth = self.frames.len(),
                remaining,
                "stack overflow"
            );
            self.raise(WellKnown::StackOverflowError, None);
            return false;
        }
        if cost > remaining {
            self.fatal("thread stack exhausted while unwinding a stack overflow");
        }
        true
    }

    /// Synchronized-method locking and entry notifications for the frame
    /// just pushed.
    fn enter_method(&mut self, method: &MethodDescription) {
        if method.is_synchronized() {
            let runtime = self.runtime.clone();
            let object = if method.is_static() {
                let class = runtime.resolver.well_known(WellKnown::Class);
                runtime.heap.mirror(method.class, class)
            } else {
                self.current_frame().this
            };
            runtime.monitors.monitor_enter(self.thread_id(), object);
            vm_trace_monitor!(self, "enter (synchronized method)", object);
            self.current_frame_mut().monitors.push(object);
        }
        vm_trace_method_entry!(self, &method.name, &method.descriptor);
        if self.runtime.config.events.contains(EventMask::METHOD_ENTRY) {
            if let Some(hooks) = &self.runtime.hooks {
                hooks.method_entry(self.thread_id(), method);
            }
        }
    }

    fn call_native(&mut self, method: Arc<MethodDescription>, site: CallSite) -> Invocation {
        let args: Vec<Value> = match site {
            CallSite::Bytecode(_) => {
                let arg_slots = method.argument_slots();
                let caller = self.current_frame_mut();
                let mut depth = arg_slots;
                let mut args = Vec::with_capacity(method.signature.parameters.len() + 1);
                if !method.is_static() {
                    depth -= 1;
                    args.push(Value::Ref(caller.stack.peek_ref(depth)));
                }
                for param in &method.signature.parameters {
                    depth -= param.slot_count();
                    args.push(caller.stack.peek_value(depth, *param));
                }
                caller.stack.pop_clear_ref(arg_slots);
                args
            }
            CallSite::Entry(args) => args.to_vec(),
        };

        if !self.reserve(FRAME_OVERHEAD) {
            return Invocation::Raised;
        }
        let caller = self.frames.len().checked_sub(1);
        let mut frame = Frame::native(method.clone(), self.runtime.config.addressing, caller);
        frame.entry = matches!(site, CallSite::Entry(_));
        if !method.is_static() {
            frame.this = args[0].as_object();
        }
        self.frames.push(frame);
        self.slots_in_use += FRAME_OVERHEAD;
        self.enter_method(&method);

        tracing::debug!(method = ?method, args = ?args, "calling native method");
        self.runtime.metrics.record_native_call();
        let result = self.runtime.natives.invoke(&method, &args);
        match result {
            Ok(value) => {
                let value = value.map(|v| v.narrow_to(method.return_type()));
                vm_msg!(self, "-- native returned {:?} --", value);
                self.teardown(value, None);
                if let CallSite::Bytecode(length) = site {
                    let caller = self.current_frame_mut();
                    if let Some(v) = value {
                        caller.stack.push_value(v);
                    }
                    caller.pc += length;
                }
                Invocation::Completed(value)
            }
            Err(e) => {
                tracing::warn!(method = ?method, error = %e, "native call failed");
                let class = self.runtime.resolver.class(method.class);
                self.teardown(None, None);
                self.raise(
                    WellKnown::UnsatisfiedLinkError,
                    Some(format!("{class}.{method:?}: {e}")),
                );
                Invocation::Raised
            }
        }
    }

    /// Releases every monitor the top frame still holds.
    pub(crate) fn release_monitors(&mut self) {
        let runtime = self.runtime.clone();
        let thread = self.thread_id();
        while let Some(object) = self.current_frame_mut().monitors.pop() {
            vm_trace_monitor!(self, "exit (frame teardown)", object);
            if let Err(e) = runtime.monitors.monitor_exit(thread, object) {
                tracing::warn!(error = %e, "monitor released during teardown was not held");
            }
        }
    }

    /// Removes the top frame after releasing its monitors and notifying
    /// tools. `exception` is set when the frame ends by unwinding.
    pub(crate) fn teardown(&mut self, result: Option<Value>, exception: Option<ObjectRef>) -> Frame {
        self.release_monitors();
        let events = self.runtime.config.events;
        {
            let frame = self.current_frame();
            let outcome = match (exception, result) {
                (Some(e), _) => format!("threw {e:?}"),
                (None, Some(v)) => format!("returned {v:?}"),
                (None, None) => "returned".to_string(),
            };
            vm_trace_method_exit!(self, &frame.method.name, &outcome);
            if events.contains(EventMask::METHOD_EXIT) {
                if let Some(hooks) = &self.runtime.hooks {
                    hooks.method_exit(self.thread_id(), &frame.method, result, exception);
                }
            }
            if events.contains(EventMask::FRAME_POP) {
                for listener in &frame.pop_listeners {
                    listener.frame_popped(self.thread_id(), &frame.method, exception.is_some());
                }
            }
        }
        let Some(frame) = self.frames.pop() else {
            unreachable!("teardown without a frame")
        };
        self.slots_in_use -= frame.slots;
        frame
    }

    /// Finishes a return instruction: tears the frame down and hands the
    /// value to the caller, whose pc then moves past the invoke.
    pub(crate) fn complete_return(&mut self, value: Option<Value>) -> Option<Value> {
        let return_type = self.current_frame().method.return_type();
        let value = match (value, return_type) {
            (_, BasicType::Void) => None,
            (Some(v), ty) => Some(v.narrow_to(ty)),
            (None, _) => self.fatal("value-returning method returned nothing"),
        };
        let frame = self.teardown(value, None);
        if !frame.entry {
            let caller = self.current_frame_mut();
            if let Some(v) = value {
                caller.stack.push_value(v);
            }
            caller.pc += frame.call_length;
        }
        value
    }

    /// Abandons the top frame at a debugger's request. The caller gets its
    /// arguments back and will re-execute the invoke.
    pub(crate) fn finish_pop(&mut self) {
        vm_msg!(self, "-- popping frame {} --", self.current_frame().describe());
        self.release_monitors();
        let Some(frame) = self.frames.pop() else {
            unreachable!("pop without a frame")
        };
        self.slots_in_use -= frame.slots;
        self.pending = None;

        let caller = self.current_frame_mut();
        for (slot, tag) in frame.saved_args.into_iter().flatten() {
            caller.stack.push_slot(slot, tag);
        }
    }

    /// Checks for a pending pop request on the top frame.
    pub(crate) fn poll_frame_pop(&mut self) -> bool {
        let thread = self.thread_id();
        let runtime = self.runtime.clone();
        let frame = self.current_frame_mut();
        if frame.pop_state == FramePopState::Available {
            if let Some(hooks) = &runtime.hooks {
                if hooks.pop_frame_requested(thread, frame) {
                    frame.pop_state = FramePopState::Now;
                }
            }
        }
        frame.pop_state == FramePopState::Now
    }

    /// Arguments a pop would hand back to the caller, deepest first.
    pub fn saved_arguments(&self) -> Option<&[(Slot, Tag)]> {
        self.current_frame().saved_args.as_deref()
    }
}

use crate::{
    types::{MethodCode, MethodDescription},
    value::{AddressingMode, ObjectRef, Slot, Tag},
    vm::{FramePopListener, Locals, OperandStack},
};
use std::sync::Arc;

/// Bookkeeping slots charged to every frame on top of its stack and locals.
pub const FRAME_OVERHEAD: usize = 8;

/// Whether a debugger may pop a frame, and whether it asked to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramePopState {
    #[default]
    Unavailable,
    Available,
    Now,
}

#[derive(Clone, Copy, Debug)]
struct MonitorNode {
    object: ObjectRef,
    next: Option<usize>,
}

/// Monitors a frame currently holds, most recent first. Nodes released by
/// an exit go onto a free list and are reused by the next enter.
#[derive(Debug, Default)]
pub struct MonitorList {
    nodes: Vec<MonitorNode>,
    head: Option<usize>,
    free: Option<usize>,
    len: usize,
}

impl MonitorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, object: ObjectRef) {
        let node = MonitorNode {
            object,
            next: self.head,
        };
        let index = match self.free {
            Some(i) => {
                self.free = self.nodes[i].next;
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.head = Some(index);
        self.len += 1;
    }

    fn release(&mut self, index: usize) {
        self.nodes[index].next = self.free;
        self.nodes[index].object = ObjectRef::NULL;
        self.free = Some(index);
        self.len -= 1;
    }

    pub fn pop(&mut self) -> Option<ObjectRef> {
        let index = self.head?;
        let object = self.nodes[index].object;
        self.head = self.nodes[index].next;
        self.release(index);
        Some(object)
    }

    /// Drops the most recent record of `object`. Returns false if the frame
    /// never entered it.
    pub fn remove(&mut self, object: ObjectRef) -> bool {
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            let next = self.nodes[i].next;
            if self.nodes[i].object == object {
                match prev {
                    Some(p) => self.nodes[p].next = next,
                    None => self.head = next,
                }
                self.release(i);
                return true;
            }
            prev = Some(i);
            cursor = next;
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.nodes[cursor?];
            cursor = node.next;
            Some(node.object)
        })
    }

    /// Nodes allocated so far, in use or free.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }
}

/// One activation record.
pub struct Frame {
    pub method: Arc<MethodDescription>,
    pub pc: usize,
    pub stack: OperandStack,
    pub locals: Locals,
    pub monitors: MonitorList,
    /// Receiver of instance methods, null for statics.
    pub this: ObjectRef,
    pub pop_state: FramePopState,
    pub pop_listeners: Vec<Arc<dyn FramePopListener>>,
    /// Exception currently being dispatched in this frame.
    pub thrown: ObjectRef,
    /// Exception already reported to tools, so propagating it through this
    /// frame does not report it again.
    pub reported: ObjectRef,
    /// Index of the calling frame in the owning call stack.
    pub caller: Option<usize>,
    pub(crate) entry: bool,
    pub(crate) saved_args: Option<Vec<(Slot, Tag)>>,
    /// Length of the caller's invoke instruction.
    pub(crate) call_length: usize,
    pub(crate) slots: usize,
}

impl Frame {
    pub(crate) fn interpreted(
        method: Arc<MethodDescription>,
        code: &MethodCode,
        codec: AddressingMode,
        caller: Option<usize>,
    ) -> Self {
        let stack = OperandStack::new(code.max_stack as usize, codec);
        let locals = Locals::new(code.max_locals as usize, codec);
        let slots = Self::cost(code);
        Self::with_storage(method, stack, locals, caller, slots)
    }

    /// A frame standing for a call in progress across the native boundary.
    /// It has no bytecode, stack or locals.
    pub(crate) fn native(method: Arc<MethodDescription>, codec: AddressingMode, caller: Option<usize>) -> Self {
        let stack = OperandStack::new(0, codec);
        let locals = Locals::new(0, codec);
        Self::with_storage(method, stack, locals, caller, FRAME_OVERHEAD)
    }

    fn with_storage(
        method: Arc<MethodDescription>,
        stack: OperandStack,
        locals: Locals,
        caller: Option<usize>,
        slots: usize,
    ) -> Self {
        Self {
            method,
            pc: 0,
            stack,
            locals,
            monitors: MonitorList::new(),
            this: ObjectRef::NULL,
            pop_state: FramePopState::Unavailable,
            pop_listeners: vec![],
            thrown: ObjectRef::NULL,
            reported: ObjectRef::NULL,
            caller,
            entry: false,
            saved_args: None,
            call_length: 0,
            slots,
        }
    }

    /// Slots a frame for `code` takes out of the thread's budget.
    pub fn cost(code: &MethodCode) -> usize {
        code.max_stack as usize + code.max_locals as usize + FRAME_OVERHEAD
    }

    pub fn is_native(&self) -> bool {
        self.method.is_native()
    }

    pub fn is_entry(&self) -> bool {
        self.entry
    }

    /// Pushes local `index`. `wide` values span two locals.
    #[inline]
    pub fn load_local(&mut self, index: usize, wide: bool) {
        if wide {
            self.stack.push(2);
            self.stack.set_long(0, self.locals.get_long(index));
        } else {
            self.stack.push_slot(self.locals.get(index), self.locals.tag(index));
        }
    }

    #[inline]
    pub fn store_local(&mut self, index: usize, wide: bool) {
        if wide {
            let bits = self.stack.get_long(0);
            self.stack.pop(2);
            self.locals.set_long(index, bits);
        } else {
            let (slot, tag) = self.stack.pop_slot();
            self.locals.set(index, slot, tag);
        }
    }

    pub fn describe(&self) -> String {
        format!("{:?} @ {}", self.method, self.pc)
    }
}

use crate::{
    types::{FieldDescription, MethodDescription, MethodId},
    value::{ObjectRef, Value},
    vm::{Frame, ThreadId},
};
use bitflags::bitflags;

bitflags! {
    /// Tool notifications the interpreter reports. An empty mask skips every
    /// hook call site.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EventMask: u16 {
        const METHOD_ENTRY = 1 << 0;
        const METHOD_EXIT = 1 << 1;
        const SINGLE_STEP = 1 << 2;
        const FIELD_ACCESS = 1 << 3;
        const FIELD_MODIFICATION = 1 << 4;
        const FRAME_POP = 1 << 5;
        const BREAKPOINT = 1 << 6;
        const EXCEPTION = 1 << 7;
        const EXCEPTION_CATCH = 1 << 8;
        /// Frames may be popped on request; they keep a copy of their
        /// arguments for the re-issued call.
        const POP_FRAME = 1 << 9;
    }
}

/// A bytecode position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    pub method: MethodId,
    pub pc: usize,
}

impl Location {
    pub fn of(frame: &Frame) -> Self {
        Self {
            method: frame.method.id,
            pc: frame.pc,
        }
    }
}

/// Receives the notifications enabled in [`EventMask`]. Every method has an
/// empty default so tools only implement what they listen for.
#[allow(unused_variables)]
pub trait DebugHooks: Send + Sync {
    fn method_entry(&self, thread: ThreadId, method: &MethodDescription) {}

    /// Exactly one of `result` (absent for `void`) and `exception` describes
    /// how the frame ended.
    fn method_exit(
        &self,
        thread: ThreadId,
        method: &MethodDescription,
        result: Option<Value>,
        exception: Option<ObjectRef>,
    ) {
    }

    fn single_step(&self, thread: ThreadId, frame: &Frame) {}

    fn field_access(
        &self,
        thread: ThreadId,
        location: Location,
        field: &FieldDescription,
        object: Option<ObjectRef>,
    ) {
    }

    fn field_modification(
        &self,
        thread: ThreadId,
        location: Location,
        field: &FieldDescription,
        object: Option<ObjectRef>,
        value: Value,
    ) {
    }

    /// Called when a `breakpoint` trap executes. Returns the opcode the trap
    /// replaced, which is then executed in its place.
    fn breakpoint(&self, thread: ThreadId, frame: &Frame) -> Option<u8> {
        None
    }

    /// `catch` is where the exception will eventually be caught, if anywhere.
    fn exception(
        &self,
        thread: ThreadId,
        location: Location,
        exception: ObjectRef,
        catch: Option<Location>,
    ) {
    }

    fn exception_catch(&self, thread: ThreadId, location: Location, exception: ObjectRef) {}

    /// Polled between instructions of poppable frames. Returning true pops
    /// the frame before its next instruction runs.
    fn pop_frame_requested(&self, thread: ThreadId, frame: &Frame) -> bool {
        false
    }
}

/// Notified when a frame of the method it was registered for goes away.
pub trait FramePopListener: Send + Sync {
    fn frame_popped(&self, thread: ThreadId, method: &MethodDescription, by_exception: bool);
}

use crate::{
    value::{ObjectRef, ReferenceCodec, Tag},
    vm::CallStack,
};

/// Where a thread root was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RootKind {
    OperandStack,
    Local,
    Receiver,
    Monitor,
    /// Caller arguments a frame keeps so a pop can hand them back.
    SavedArgument,
    /// Exception being dispatched inside a frame.
    Thrown,
    /// Exception pending on the thread itself.
    PendingException,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Root {
    /// Frame index in the call stack; `None` for thread-level roots.
    pub frame: Option<usize>,
    pub kind: RootKind,
    /// Slot, local, monitor or saved argument position within the frame.
    pub index: usize,
    pub object: ObjectRef,
}

impl CallStack {
    /// Reports every non-null reference this thread keeps alive, walking the
    /// frame chain from the top through the caller links. Only slots tagged
    /// as objects are reported, including arguments saved for a frame pop.
    pub fn visit_roots(&self, mut visit: impl FnMut(Root)) {
        let mut report = |frame, kind, index, object: ObjectRef| {
            if !object.is_null() {
                visit(Root {
                    frame,
                    kind,
                    index,
                    object,
                });
            }
        };

        if let Some(pending) = self.pending {
            report(None, RootKind::PendingException, 0, pending);
        }

        let codec = self.runtime.config.addressing;
        let mut cursor = self.frames.len().checked_sub(1);
        while let Some(i) = cursor {
            let frame = &self.frames[i];
            for (index, object) in frame.stack.references() {
                report(Some(i), RootKind::OperandStack, index, object);
            }
            for (index, object) in frame.locals.references() {
                report(Some(i), RootKind::Local, index, object);
            }
            report(Some(i), RootKind::Receiver, 0, frame.this);
            for (index, object) in frame.monitors.iter().enumerate() {
                report(Some(i), RootKind::Monitor, index, object);
            }
            for (index, (slot, tag)) in frame.saved_args.iter().flatten().enumerate() {
                if *tag == Tag::Object {
                    report(Some(i), RootKind::SavedArgument, index, codec.decode(slot.raw_ref()));
                }
            }
            report(Some(i), RootKind::Thrown, 0, frame.thrown);
            cursor = frame.caller;
        }
    }

    pub fn collect_roots(&self) -> Vec<Root> {
        let mut roots = vec![];
        self.visit_roots(|r| roots.push(r));
        roots
    }
}

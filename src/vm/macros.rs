#[macro_export]
macro_rules! vm_msg {
    ($src:expr, $($format:tt)*) => {
        if $src.tracer_enabled() {
            $src.tracer().msg($src.indent(), format_args!($($format)*))
        }
    }
}

#[macro_export]
macro_rules! vm_trace_instruction {
    ($src:expr, $pc:expr, $instr:expr) => {
        if $src.tracer_enabled() {
            $src.tracer().trace_instruction($src.indent(), $pc, $instr);
        }
    };
}

#[macro_export]
macro_rules! vm_trace_method_entry {
    ($src:expr, $name:expr, $desc:expr) => {
        if $src.tracer_enabled() {
            $src.tracer().trace_method_entry($src.indent(), $name, $desc);
        }
    };
}

#[macro_export]
macro_rules! vm_trace_method_exit {
    ($src:expr, $name:expr, $outcome:expr) => {
        if $src.tracer_enabled() {
            $src.tracer().trace_method_exit($src.indent(), $name, $outcome);
        }
    };
}

#[macro_export]
macro_rules! vm_trace_exception {
    ($src:expr, $exc:expr, $location:expr) => {
        if $src.tracer_enabled() {
            $src.tracer()
                .trace_exception($src.indent(), &format!("{:?}", $exc), &format!("{:?}", $location));
        }
    };
}

#[macro_export]
macro_rules! vm_trace_branch {
    ($src:expr, $type:expr, $target:expr, $taken:expr) => {
        if $src.tracer_enabled() {
            $src.tracer()
                .trace_branch($src.indent(), $type, $target, $taken);
        }
    };
}

#[macro_export]
macro_rules! vm_trace_field {
    ($src:expr, $op:expr, $field:expr, $val:expr) => {
        if $src.tracer_enabled() {
            $src.tracer()
                .trace_field_access($src.indent(), $op, &format!("{:?}", $field), &format!("{:?}", $val));
        }
    };
}

#[macro_export]
macro_rules! vm_trace_monitor {
    ($src:expr, $op:expr, $obj:expr) => {
        if $src.tracer_enabled() {
            $src.tracer()
                .trace_monitor($src.indent(), $op, &format!("{:?}", $obj));
        }
    };
}

#[macro_export]
macro_rules! vm_trace_safepoint {
    ($src:expr, $pc:expr) => {
        if $src.tracer_enabled() {
            $src.tracer().trace_safepoint($src.indent(), $pc);
        }
    };
}

#[macro_export]
macro_rules! vm_trace_stack_snapshot {
    ($src:expr) => {
        if $src.tracer_enabled() {
            $src.trace_dump_frames();
        }
    };
}

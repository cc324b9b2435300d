//! Buffered execution tracer for the interpreter.
//!
//! Output is enabled per process through the environment and costs one
//! branch per trace point when disabled.
//!
//! ## Environment Variables
//!
//! - `JVM_RS_TRACE`: Enable tracing
//!   - `"1"`, `"true"`, or `"stdout"`: Write to stdout
//!   - `"stderr"`: Write to stderr
//!   - `<path>`: Write to file at path
//!
//! - `JVM_RS_TRACE_FLUSH_INTERVAL`: Number of messages before auto-flush (default: 10000)
//!
//! - `JVM_RS_TRACE_STATS`: Print counters when the tracer is dropped (`"1"` or `"true"`)
//!
//! ```ignore
//! vm_msg!(stack, "resolved {:?}", method);
//! vm_trace_instruction!(stack, pc, "iadd");
//! vm_trace_method_entry!(stack, "Main.fib", "(I)I");
//! vm_trace_stack_snapshot!(stack);
//! ```
use std::{
    cell::{Cell, RefCell},
    env,
    fs::File,
    io::{stderr, stdout, BufWriter, Write},
};

const BUFFER_SIZE: usize = 256 * 1024;
const AUTO_FLUSH_INTERVAL: usize = 10_000;

#[derive(Debug, Clone, Default)]
pub struct TraceStats {
    pub total_messages: usize,
    pub instructions_traced: usize,
    pub method_calls: usize,
    pub method_returns: usize,
    pub exceptions: usize,
    pub branches: usize,
    pub field_accesses: usize,
    pub monitor_ops: usize,
    pub safepoints: usize,
}

pub struct Tracer {
    enabled: bool,
    writer: RefCell<Option<BufWriter<Box<dyn Write + Send>>>>,
    message_count: Cell<usize>,
    auto_flush_interval: usize,
    stats: RefCell<TraceStats>,
    detailed_stats: bool,
}

impl Tracer {
    pub fn new() -> Self {
        let (enabled, writer): (bool, Option<Box<dyn Write + Send>>) =
            match env::var("JVM_RS_TRACE") {
                Ok(val) if val == "1" || val == "true" || val == "stdout" => {
                    (true, Some(Box::new(stdout())))
                }
                Ok(val) if val == "stderr" => (true, Some(Box::new(stderr()))),
                Ok(val) if !val.is_empty() => match File::create(&val) {
                    Ok(f) => (true, Some(Box::new(f))),
                    Err(e) => {
                        tracing::warn!("failed to create trace file {}: {}", val, e);
                        (false, None)
                    }
                },
                _ => (false, None),
            };

        let auto_flush_interval = env::var("JVM_RS_TRACE_FLUSH_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(AUTO_FLUSH_INTERVAL);

        let detailed_stats = env::var("JVM_RS_TRACE_STATS")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);

        Self {
            enabled,
            writer: RefCell::new(writer.map(|w| BufWriter::with_capacity(BUFFER_SIZE, w))),
            message_count: Cell::new(0),
            auto_flush_interval,
            stats: RefCell::new(TraceStats::default()),
            detailed_stats,
        }
    }

    /// A tracer writing into an arbitrary sink, regardless of the environment.
    pub fn to_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            enabled: true,
            writer: RefCell::new(Some(BufWriter::with_capacity(BUFFER_SIZE, writer))),
            message_count: Cell::new(0),
            auto_flush_interval: AUTO_FLUSH_INTERVAL,
            stats: RefCell::new(TraceStats::default()),
            detailed_stats: true,
        }
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline(always)]
    fn write_msg(&self, indent: usize, args: std::fmt::Arguments) {
        if let Some(ref mut writer) = *self.writer.borrow_mut() {
            for _ in 0..indent {
                let _ = writer.write_all(b"  ");
            }
            let _ = writer.write_fmt(args);
            let _ = writer.write_all(b"\n");

            let count = self.message_count.get() + 1;
            self.message_count.set(count);
            if count >= self.auto_flush_interval {
                let _ = writer.flush();
                self.message_count.set(0);
            }
        }
    }

    fn count(&self, f: impl FnOnce(&mut TraceStats)) {
        if self.detailed_stats {
            let mut stats = self.stats.borrow_mut();
            stats.total_messages += 1;
            f(&mut stats);
        }
    }

    pub fn msg(&self, indent: usize, args: std::fmt::Arguments) {
        if !self.enabled {
            return;
        }
        self.count(|_| {});
        self.write_msg(indent, args);
    }

    pub fn flush(&self) {
        if self.enabled {
            if let Some(ref mut writer) = *self.writer.borrow_mut() {
                let _ = writer.flush();
            }
            self.message_count.set(0);
        }
    }

    pub fn trace_instruction(&self, indent: usize, pc: usize, instruction: &str) {
        if !self.enabled {
            return;
        }
        self.count(|s| s.instructions_traced += 1);
        self.write_msg(indent, format_args!("[PC:{:04}] {}", pc, instruction));
    }

    pub fn trace_method_entry(&self, indent: usize, name: &str, descriptor: &str) {
        if !self.enabled {
            return;
        }
        self.count(|s| s.method_calls += 1);
        self.write_msg(indent, format_args!("→ CALL {}{}", name, descriptor));
    }

    pub fn trace_method_exit(&self, indent: usize, name: &str, outcome: &str) {
        if !self.enabled {
            return;
        }
        self.count(|s| s.method_returns += 1);
        self.write_msg(indent, format_args!("← {} {}", outcome, name));
    }

    pub fn trace_exception(&self, indent: usize, exception: &str, location: &str) {
        if !self.enabled {
            return;
        }
        self.count(|s| s.exceptions += 1);
        self.write_msg(indent, format_args!("⚠ EXC  {} at {}", exception, location));
    }

    pub fn trace_branch(&self, indent: usize, branch_type: &str, target: usize, taken: bool) {
        if !self.enabled {
            return;
        }
        self.count(|s| s.branches += 1);
        let status = if taken { "TAKEN" } else { "NOT TAKEN" };
        self.write_msg(
            indent,
            format_args!("↷ {} to {:04} ({})", branch_type, target, status),
        );
    }

    pub fn trace_field_access(&self, indent: usize, op: &str, field: &str, value: &str) {
        if !self.enabled {
            return;
        }
        self.count(|s| s.field_accesses += 1);
        self.write_msg(indent, format_args!("  FIELD {} {} = {}", op, field, value));
    }

    pub fn trace_monitor(&self, indent: usize, op: &str, object: &str) {
        if !self.enabled {
            return;
        }
        self.count(|s| s.monitor_ops += 1);
        self.write_msg(indent, format_args!("  MONITOR {} {}", op, object));
    }

    pub fn trace_safepoint(&self, indent: usize, pc: usize) {
        if !self.enabled {
            return;
        }
        self.count(|s| s.safepoints += 1);
        self.write_msg(indent, format_args!("  SAFEPOINT at {:04}", pc));
    }

    pub fn get_stats(&self) -> TraceStats {
        self.stats.borrow().clone()
    }

    pub fn print_stats(&self) {
        if !self.detailed_stats {
            return;
        }
        let stats = self.stats.borrow();
        eprintln!("\n=== Tracer Statistics ===");
        eprintln!("Total messages:      {:>12}", stats.total_messages);
        eprintln!("Instructions traced: {:>12}", stats.instructions_traced);
        eprintln!("Method calls:        {:>12}", stats.method_calls);
        eprintln!("Method returns:      {:>12}", stats.method_returns);
        eprintln!("Exceptions:          {:>12}", stats.exceptions);
        eprintln!("Branches:            {:>12}", stats.branches);
        eprintln!("Field accesses:      {:>12}", stats.field_accesses);
        eprintln!("Monitor operations:  {:>12}", stats.monitor_ops);
        eprintln!("Safepoints:          {:>12}", stats.safepoints);
        eprintln!("========================\n");
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.detailed_stats && self.enabled {
            self.print_stats();
        }
        self.flush();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    /// Writes the frame chain, innermost first. Each entry is one frame's
    /// description followed by its operand stack rendering.
    pub fn dump_frames(&self, frames: &[(String, Vec<String>)]) {
        if !self.enabled {
            return;
        }

        self.msg(0, format_args!(""));
        self.msg(
            0,
            format_args!("╔════════════════════════════════════════════════════════════"),
        );
        self.msg(0, format_args!("║ FRAME CHAIN ({} frames)", frames.len()));
        self.msg(
            0,
            format_args!("╠════════════════════════════════════════════════════════════"),
        );
        for (header, stack) in frames {
            self.msg(0, format_args!("╟─ {}", header));
            if stack.is_empty() {
                self.msg(0, format_args!("║ (empty stack)"));
            }
            for (depth, content) in stack.iter().enumerate() {
                self.msg(0, format_args!("║ [{:4}] {}", depth, content));
            }
        }
        self.msg(
            0,
            format_args!("╚════════════════════════════════════════════════════════════"),
        );
    }
}

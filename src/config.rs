//! Runtime configuration types.

/// Runtime configuration for the VM
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Call-stack arena capacity in bytes; all frames share it
    pub call_stack_capacity: usize,
    /// Whether the heap collects on growth past its threshold
    /// (`std::memory::gc` always collects)
    pub gc_enabled: bool,
    /// Print a line per collection cycle to stderr
    pub trace_gc: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            call_stack_capacity: 10_000,
            gc_enabled: true,
            trace_gc: false,
        }
    }
}

//! Backend configuration.

/// Default size of the per-query virtual-memory arena: 2 GiB reserved,
/// committed lazily by the OS as it is touched.
pub const DEFAULT_VM_SIZE: usize = 2 << 30;

/// Configuration bit-set of a Wasm context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextConfig(pub u8);

impl ContextConfig {
    /// Interleave unmapped guard pages between host-appended arena regions
    /// so that out-of-bounds guest writes trap instead of corrupting a
    /// neighboring region.
    pub const TRAP_GUARD_PAGES: ContextConfig = ContextConfig(1 << 0);

    pub fn contains(&self, flag: ContextConfig) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn with(self, flag: ContextConfig) -> ContextConfig {
        ContextConfig(self.0 | flag.0)
    }
}

/// Options recognized by the backend. Defaults are conservative.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Optimization level for generated modules, 0 to 2.
    pub wasm_optimization_level: u8,
    /// Execute Wasm adaptively: trade peak throughput for a fast baseline
    /// compile.
    pub wasm_adaptive: bool,
    /// Whether the engine's compilation cache is enabled.
    pub wasm_compilation_cache: bool,
    /// Dump the generated module as WAT to stdout.
    pub wasm_dump: bool,
    /// Dump information about the compiled machine code to stdout.
    pub asm_dump: bool,
    /// A port >= 1024 activates the remote inspector for the next query.
    pub cdt_port: u16,
    /// Report per-query statistics (code sizes, timings, allocator counters).
    pub statistics: bool,
    /// Suppress the `<n> rows` trailer on print sinks.
    pub quiet: bool,
    /// Size of the reserved virtual-memory arena per query.
    pub vm_size: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        BackendOptions {
            wasm_optimization_level: 0,
            wasm_adaptive: false,
            wasm_compilation_cache: true,
            wasm_dump: false,
            asm_dump: false,
            cdt_port: 0,
            statistics: false,
            quiet: false,
            vm_size: DEFAULT_VM_SIZE,
        }
    }
}

impl BackendOptions {
    /// Whether the inspector is active for this configuration.
    pub fn inspector_enabled(&self) -> bool {
        self.cdt_port >= 1024
    }
}

//! Engine configuration.

use std::path::PathBuf;

/// Host-supplied configuration for one [`crate::Context`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory under which script paths are resolved.
    pub workspace_root: PathBuf,
    /// Directory for the persistence database and caches.
    pub support_dir: PathBuf,
    /// Poll for file changes (consumed by the external workspace scanner).
    pub scan_for_changes: bool,
    /// Polling interval when scanning is enabled.
    pub scan_interval_ms: u32,
    /// Emit per-pass compiler and optimizer debug logs.
    pub debug_logging: bool,
    /// Short-circuit every script call into a no-op.
    pub disable_execution: bool,
    /// Run only optimization steps flagged required.
    pub disable_optimizations: bool,
    /// Treat compiled modules as trusted, allowing them to resolve
    /// trusted-access bindings.
    pub trusted_modules: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            support_dir: PathBuf::from(".tern"),
            scan_for_changes: false,
            scan_interval_ms: 500,
            debug_logging: false,
            disable_execution: false,
            disable_optimizations: false,
            trusted_modules: false,
        }
    }
}

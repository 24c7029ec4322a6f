//! Daemon configuration

use serde::Serialize;
use utoipa::ToSchema;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,

    /// Memory size (bytes) given to a session's VM when none is requested
    pub default_memory_size: usize,

    /// Filesystem root a loaded program's sandboxed file syscalls are
    /// confined to. `None` disables file syscalls entirely.
    pub sandbox_root: Option<String>,

    /// Idle sessions are destroyed after this many seconds without a
    /// request or WebSocket subscriber.
    pub session_inactivity_timeout_seconds: u64,

    /// Instruction budget given to `run` when a session doesn't specify
    /// one; exceeding it faults the VM with `CycleLimitExceeded`.
    pub default_instruction_budget: u64,

    /// Maximum bytes accepted by a single `POST /sessions/{id}/stdin`.
    pub max_stdin_line_bytes: usize,

    /// Per-session bounded event queue capacity for WebSocket fan-out.
    pub event_queue_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8871".to_string(),
            default_memory_size: 1 << 20,
            sandbox_root: std::env::var("ARM2D_SANDBOX_ROOT").ok(),
            session_inactivity_timeout_seconds: 30 * 60,
            default_instruction_budget: 10_000_000,
            max_stdin_line_bytes: 4096,
            event_queue_capacity: 256,
        }
    }
}

impl DaemonConfig {
    /// Creates config from environment variables, falling back to
    /// [`Default`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("ARM2D_BIND") {
            config.bind_addr = addr;
        }

        if let Ok(size) = std::env::var("ARM2D_DEFAULT_MEMORY_SIZE") {
            if let Ok(val) = size.parse() {
                config.default_memory_size = val;
            }
        }

        if let Ok(seconds) = std::env::var("ARM2D_SESSION_TIMEOUT_SECONDS") {
            if let Ok(val) = seconds.parse() {
                config.session_inactivity_timeout_seconds = val;
            }
        }

        if let Ok(budget) = std::env::var("ARM2D_DEFAULT_INSTRUCTION_BUDGET") {
            if let Ok(val) = budget.parse() {
                config.default_instruction_budget = val;
            }
        }

        if let Ok(bytes) = std::env::var("ARM2D_MAX_STDIN_LINE_BYTES") {
            if let Ok(val) = bytes.parse() {
                config.max_stdin_line_bytes = val;
            }
        }

        if let Ok(capacity) = std::env::var("ARM2D_EVENT_QUEUE_CAPACITY") {
            if let Ok(val) = capacity.parse() {
                config.event_queue_capacity = val;
            }
        }

        config
    }
}

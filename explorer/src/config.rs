//! Explorer configuration

use bytecode_tracer::config::{
    DEFAULT_MAX_INSTRUCTION_SIZE, DEFAULT_MIN_OPCODES, DEFAULT_USER_ADDRESS_LIMIT, DEFAULT_WORD_SIZE,
};
use bytecode_tracer::TracerConfig;
use path_scheduler::{LowLevelKind, SchedulerConfig, StrategyKind};

/// Default number of low-level selections between two cursor persists
pub const DEFAULT_CURSOR_WRITEBACK_RATE: u64 = 8;

/// Configuration of one exploration session
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Name of the guest thread to follow. `None` follows the first thread
    /// announced by the guest.
    pub tracked_thread: Option<String>,

    /// Minimum number of bytecode-PC updates a detection candidate must show.
    ///
    /// Defaults to [`DEFAULT_MIN_OPCODES`].
    pub min_opcodes: u64,

    /// Bound on the average encoded size of a bytecode instruction.
    ///
    /// Defaults to [`DEFAULT_MAX_INSTRUCTION_SIZE`].
    pub max_instruction_size: u64,

    /// Width in bytes of a bytecode-PC store.
    ///
    /// Defaults to [`DEFAULT_WORD_SIZE`].
    pub word_size: u8,

    /// Memory accesses at or above this address are not interpreted.
    ///
    /// Defaults to [`DEFAULT_USER_ADDRESS_LIMIT`].
    pub user_address_limit: u64,

    /// Number of low-level selections after which the cursor of the target
    /// is persisted even if the target does not change.
    ///
    /// Defaults to [`DEFAULT_CURSOR_WRITEBACK_RATE`].
    pub cursor_writeback_rate: u64,

    /// Apply the last detected structure to every new tracked thread instead
    /// of waiting for a new calibration.
    pub reuse_structure: bool,

    /// High-level path selection.
    pub strategy: StrategyKind,

    /// Low-level state selection.
    pub low_level: LowLevelKind,

    /// Log every bytecode-PC update and opcode fetch.
    pub debug_instructions: bool,

    /// Log every native frame change.
    pub debug_call_stack: bool,

    /// Log every topological index update.
    pub debug_topology: bool,
}

impl Config {
    /// Sets the `tracked_thread` config parameter to `name`.
    #[must_use]
    pub fn with_tracked_thread(mut self, name: impl Into<String>) -> Self {
        self.tracked_thread = Some(name.into());
        self
    }

    /// Sets the `min_opcodes` config parameter to `value`.
    #[must_use]
    pub fn with_min_opcodes(mut self, value: u64) -> Self {
        self.min_opcodes = value;
        self
    }

    /// Sets the `max_instruction_size` config parameter to `value`.
    #[must_use]
    pub fn with_max_instruction_size(mut self, value: u64) -> Self {
        self.max_instruction_size = value;
        self
    }

    /// Sets the `word_size` config parameter to `value`.
    #[must_use]
    pub fn with_word_size(mut self, value: u8) -> Self {
        self.word_size = value;
        self
    }

    /// Sets the `user_address_limit` config parameter to `value`.
    #[must_use]
    pub fn with_user_address_limit(mut self, value: u64) -> Self {
        self.user_address_limit = value;
        self
    }

    /// Sets the `cursor_writeback_rate` config parameter to `value`.
    #[must_use]
    pub fn with_cursor_writeback_rate(mut self, value: u64) -> Self {
        self.cursor_writeback_rate = value;
        self
    }

    /// Sets the `reuse_structure` config parameter to `value`.
    #[must_use]
    pub fn with_reuse_structure(mut self, value: bool) -> Self {
        self.reuse_structure = value;
        self
    }

    /// Sets the `strategy` config parameter to `value`.
    #[must_use]
    pub fn with_strategy(mut self, value: StrategyKind) -> Self {
        self.strategy = value;
        self
    }

    /// Sets the `low_level` config parameter to `value`.
    #[must_use]
    pub fn with_low_level(mut self, value: LowLevelKind) -> Self {
        self.low_level = value;
        self
    }

    /// Turns on every debug logging toggle.
    #[must_use]
    pub fn with_debug_logging(mut self) -> Self {
        self.debug_instructions = true;
        self.debug_call_stack = true;
        self.debug_topology = true;
        self
    }

    /// Configuration of the native and bytecode tracers
    pub fn tracer_config(&self) -> TracerConfig {
        TracerConfig {
            min_opcodes: self.min_opcodes,
            max_instruction_size: self.max_instruction_size,
            word_size: self.word_size,
            user_address_limit: self.user_address_limit,
            debug_instructions: self.debug_instructions,
            debug_call_stack: self.debug_call_stack,
        }
    }

    /// Configuration of the path scheduler
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            strategy: self.strategy,
            low_level: self.low_level,
            cursor_writeback_rate: self.cursor_writeback_rate,
            debug_topology: self.debug_topology,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracked_thread: None,
            min_opcodes: DEFAULT_MIN_OPCODES,
            max_instruction_size: DEFAULT_MAX_INSTRUCTION_SIZE,
            word_size: DEFAULT_WORD_SIZE,
            user_address_limit: DEFAULT_USER_ADDRESS_LIMIT,
            cursor_writeback_rate: DEFAULT_CURSOR_WRITEBACK_RATE,
            reuse_structure: true,
            strategy: StrategyKind::default(),
            low_level: LowLevelKind::default(),
            debug_instructions: false,
            debug_call_stack: false,
            debug_topology: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_configs() {
        let config = Config::default()
            .with_min_opcodes(12)
            .with_word_size(4)
            .with_strategy(StrategyKind::Random { seed: 7 })
            .with_cursor_writeback_rate(3)
            .with_debug_logging();

        let tracer = config.tracer_config();
        assert_eq!(tracer.min_opcodes, 12);
        assert_eq!(tracer.word_size, 4);
        assert!(tracer.debug_call_stack);

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.strategy, StrategyKind::Random { seed: 7 });
        assert_eq!(scheduler.cursor_writeback_rate, 3);
        assert!(scheduler.debug_topology);
    }
}

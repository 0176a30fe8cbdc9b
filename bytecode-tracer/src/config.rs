//! Configuration of the low-level tracers

/// Default lower bound for the calibration length threshold
pub const DEFAULT_MIN_OPCODES: u64 = 5;

/// Default bound on the average encoded size of one bytecode instruction
pub const DEFAULT_MAX_INSTRUCTION_SIZE: u64 = 1024;

/// Default width in bytes of a bytecode-PC store
pub const DEFAULT_WORD_SIZE: u8 = 8;

/// Accesses at or above this address belong to the guest kernel
pub const DEFAULT_USER_ADDRESS_LIMIT: u64 = 0xc000_0000;

/// Configuration shared by the call tracer, the interpreter detector and the
/// interpreter tracer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TracerConfig {
    /// Minimum number of bytecode-PC updates a candidate must show, even when
    /// the guest declared fewer exercised instructions.
    ///
    /// Defaults to [`DEFAULT_MIN_OPCODES`].
    pub min_opcodes: u64,

    /// A candidate bytecode-PC variable whose values span more than
    /// `updates * max_instruction_size` bytes is rejected.
    ///
    /// Defaults to [`DEFAULT_MAX_INSTRUCTION_SIZE`].
    pub max_instruction_size: u64,

    /// Only writes of exactly this many bytes are bytecode-PC candidates.
    ///
    /// Defaults to [`DEFAULT_WORD_SIZE`].
    pub word_size: u8,

    /// Memory accesses at or above this address are ignored. The host may
    /// report kernel-space accesses made while handling an interrupt before
    /// the privilege level of the task is updated.
    ///
    /// Defaults to [`DEFAULT_USER_ADDRESS_LIMIT`].
    pub user_address_limit: u64,

    /// Log every bytecode-PC update and opcode fetch.
    pub debug_instructions: bool,

    /// Log every native frame push, pop and resize.
    pub debug_call_stack: bool,
}

impl TracerConfig {
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
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            min_opcodes: DEFAULT_MIN_OPCODES,
            max_instruction_size: DEFAULT_MAX_INSTRUCTION_SIZE,
            word_size: DEFAULT_WORD_SIZE,
            user_address_limit: DEFAULT_USER_ADDRESS_LIMIT,
            debug_instructions: false,
            debug_call_stack: false,
        }
    }
}

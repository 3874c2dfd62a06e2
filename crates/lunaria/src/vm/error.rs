// Error kinds. The enum stays 1 byte; the Lua error *value* travels on
// the raising thread (`LuaState::error_value`), not in the Result.

/// Error kind returned through `LuaResult`. The payload (an arbitrary Lua
/// value) is stored on the thread that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// Language-level failure: `error()`, a failed opcode, a type error.
    Runtime,
    /// Allocation failed even after an emergency collection.
    Memory,
    /// The parser rejected the source.
    Syntax,
    /// An error occurred while an error was already being handled.
    ErrErr,
    /// Not an error: a coroutine is suspending. Never escapes `resume`.
    Yield,
}

impl LuaError {
    pub fn label(self) -> &'static str {
        match self {
            LuaError::Runtime => "runtime error",
            LuaError::Memory => "not enough memory",
            LuaError::Syntax => "syntax error",
            LuaError::ErrErr => "error in error handling",
            LuaError::Yield => "yield",
        }
    }
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;

/// Error kind plus the rendered message, for host consumption (`?`,
/// `anyhow`, logging). Built by `LuaVM::into_full_error`.
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind: LuaError,
    pub message: String,
}

impl std::fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl std::error::Error for LuaFullError {}

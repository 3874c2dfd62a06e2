// Build-fixed limits and configuration constants.
//
// The C heritage makes several of these configurable per build; here they
// are fixed: 64-bit signed integers, IEEE binary64 floats, 40-byte short
// string cutoff.

/// Lua integers are `i64`, Lua floats are `f64`. Fixed per build.
pub type LuaInt = i64;
pub type LuaFloat = f64;

/// Maximum length of a short (interned) string, in bytes.
pub const MAX_SHORT_LEN: usize = 40;

/// Registers available to a single function (limited by the 8-bit A field).
pub const MAX_REGS: usize = 255;

/// Maximum number of local variables per function.
pub const MAX_VARS: usize = 200;

/// Maximum upvalues per function (limited by the instruction B field).
pub const MAX_UPVAL: usize = 255;

/// Initial value-stack slots for a new thread.
pub const BASIC_STACK_SIZE: usize = 40;

/// Extra slots kept above the declared frame top for metamethod calls.
pub const EXTRA_STACK: usize = 5;

/// Slots of headroom granted while an error is being handled. Overflowing
/// this reserve too is fatal.
pub const ERROR_STACK_RESERVE: usize = 200;

/// Default hard cap on value-stack slots (see `VmOptions::max_stack`).
pub const DEFAULT_MAX_STACK: usize = 1_000_000;

/// Default cap on call-frame depth.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

/// Cap on `__index`/`__newindex` chain length before reporting a loop.
pub const MAX_TAG_LOOP: usize = 2000;

/// Number of list items accumulated before each SETLIST flush.
pub const FIELDS_PER_FLUSH: usize = 50;

/// Multi-return marker for call result counts.
pub const MULTRET: i32 = -1;

/// Instructions between absolute line-info anchors.
pub const MAX_INSTR_WITHOUT_ABS: u8 = 128;

/// Marker in the delta line-info array: consult the absolute anchors.
pub const ABS_LINE_INFO: i8 = -0x80;

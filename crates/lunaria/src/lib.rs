// Lunaria: a Lua 5.5 compatible runtime.
// Register-based bytecode VM, incremental generational GC, single-pass
// compiler, cooperative coroutines.

#[cfg(test)]
mod test;

pub mod compiler;
pub mod gc;
pub mod limits;
pub mod stdlib;
pub mod value;
pub mod vm;

pub use gc::{Gc, GcKind, ObjectPool};
pub use stdlib::Stdlib;
pub use value::{LuaTable, LuaValue, Proto};
pub use vm::{
    CFunction, Instruction, LuaError, LuaFullError, LuaResult, LuaState, LuaVM, OpCode,
    ThreadStatus, TmKind, VmOptions,
};

pub const LUA_VERSION: &str = "Lua 5.5";

/// One-shot convenience: fresh VM, full stdlib, run the source, return
/// its results.
pub fn execute(source: &str) -> LuaResult<Vec<LuaValue>> {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_stdlib(Stdlib::All)?;
    vm.execute_string(source)
}

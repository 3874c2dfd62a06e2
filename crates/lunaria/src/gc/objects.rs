// Closures and upvalues, the pooled runtime objects that tie compiled
// code to captured variables.

use crate::gc::pool::{ThreadId, UpvalId};
use crate::value::{LuaValue, Proto};
use crate::vm::CFunction;
use std::rc::Rc;

/// A function value with captured state: a Lua closure carries a shared
/// prototype plus upvalue objects; a native closure carries a function
/// pointer plus plain value slots.
pub enum Closure {
    Lua(LuaClosure),
    Native(NativeClosure),
}

pub struct LuaClosure {
    pub proto: Rc<Proto>,
    pub upvals: Vec<UpvalId>,
}

pub struct NativeClosure {
    pub f: CFunction,
    pub upvals: Vec<LuaValue>,
}

impl Closure {
    #[inline(always)]
    pub fn is_lua(&self) -> bool {
        matches!(self, Closure::Lua(_))
    }

    #[inline(always)]
    pub fn as_lua(&self) -> Option<&LuaClosure> {
        match self {
            Closure::Lua(c) => Some(c),
            Closure::Native(_) => None,
        }
    }

    #[inline(always)]
    pub fn proto(&self) -> Option<&Rc<Proto>> {
        match self {
            Closure::Lua(c) => Some(&c.proto),
            Closure::Native(_) => None,
        }
    }

    pub fn footprint(&self) -> usize {
        let upvals = match self {
            Closure::Lua(c) => c.upvals.len() * std::mem::size_of::<UpvalId>(),
            Closure::Native(c) => c.upvals.len() * std::mem::size_of::<LuaValue>(),
        };
        std::mem::size_of::<Self>() + upvals
    }
}

/// Capture indirection with two states. Open: the variable still lives in
/// a thread's stack slot. Closed: the value moved into the upvalue itself.
/// At most one open upvalue exists per (thread, slot); closing is
/// idempotent.
pub enum Upvalue {
    Open { thread: ThreadId, slot: usize },
    Closed(LuaValue),
}

impl Upvalue {
    #[inline(always)]
    pub fn is_open(&self) -> bool {
        matches!(self, Upvalue::Open { .. })
    }

    #[inline(always)]
    pub fn open_slot(&self) -> Option<(ThreadId, usize)> {
        match self {
            Upvalue::Open { thread, slot } => Some((*thread, *slot)),
            Upvalue::Closed(_) => None,
        }
    }

    /// Captures the final stack value; a second close is a no-op by
    /// construction (the state is already `Closed`).
    #[inline]
    pub fn close(&mut self, value: LuaValue) {
        *self = Upvalue::Closed(value);
    }
}

// Compiled function body (prototype). Shared by every closure
// instantiated from it via `Rc`; the collector reaches its constants
// through the owning closures.

use crate::limits::{ABS_LINE_INFO, MAX_INSTR_WITHOUT_ABS};
use crate::value::LuaValue;
use smol_str::SmolStr;
use std::rc::Rc;

/// Where an upvalue of a nested function is captured from.
#[derive(Debug, Clone)]
pub struct UpvalDesc {
    pub name: SmolStr,
    /// True: `idx` is a register of the enclosing function (open capture).
    /// False: `idx` indexes the enclosing function's own upvalues.
    pub in_stack: bool,
    pub idx: u8,
}

/// Debug record for a local variable's live range.
#[derive(Debug, Clone)]
pub struct LocVar {
    pub name: SmolStr,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Absolute line anchor for random access into the delta-encoded line map.
#[derive(Debug, Clone, Copy)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Proto {
    pub code: Vec<u32>,
    pub constants: Vec<LuaValue>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalues: Vec<UpvalDesc>,

    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,

    // Debug information.
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    /// Per-instruction line delta; `ABS_LINE_INFO` means "look it up in
    /// `abs_line_info`".
    pub line_info: Vec<i8>,
    pub abs_line_info: Vec<AbsLineInfo>,
    pub loc_vars: Vec<LocVar>,
}

impl Proto {
    pub fn new() -> Self {
        Proto::default()
    }

    /// Line of the instruction at `pc`, resolved from the delta array and
    /// the absolute anchors.
    pub fn line_at(&self, pc: usize) -> u32 {
        if self.line_info.is_empty() {
            return 0;
        }
        let pc = pc.min(self.line_info.len() - 1);
        // Find the closest anchor at or before pc, then walk deltas.
        let (mut base_pc, mut line) = match self
            .abs_line_info
            .partition_point(|a| a.pc as usize <= pc)
            .checked_sub(1)
        {
            Some(i) => {
                let a = self.abs_line_info[i];
                (a.pc as usize, a.line)
            }
            None => (0, self.first_line()),
        };
        while base_pc < pc {
            base_pc += 1;
            debug_assert!(self.line_info[base_pc] != ABS_LINE_INFO);
            line = line.wrapping_add_signed(self.line_info[base_pc] as i32);
        }
        line
    }

    fn first_line(&self) -> u32 {
        if self.line_info.first() == Some(&ABS_LINE_INFO) {
            self.abs_line_info.first().map(|a| a.line).unwrap_or(0)
        } else {
            self.line_defined
                .wrapping_add_signed(self.line_info.first().copied().unwrap_or(0) as i32)
        }
    }

    /// Name of the local occupying `reg` at `pc`, if debug info kept it.
    pub fn local_name(&self, mut reg: usize, pc: u32) -> Option<&str> {
        for lv in &self.loc_vars {
            if lv.start_pc > pc {
                break;
            }
            if pc < lv.end_pc {
                if reg == 0 {
                    return Some(&lv.name);
                }
                reg -= 1;
            }
        }
        None
    }
}

/// Appends line info for one freshly emitted instruction, maintaining the
/// delta array + sparse anchor scheme.
pub fn add_line_info(proto: &mut Proto, last_line: &mut u32, iwthabs: &mut u8, line: u32) {
    let delta = line as i64 - *last_line as i64;
    *iwthabs = iwthabs.wrapping_add(1);
    if delta.unsigned_abs() >= ABS_LINE_INFO.unsigned_abs() as u64
        || *iwthabs >= MAX_INSTR_WITHOUT_ABS
    {
        proto.abs_line_info.push(AbsLineInfo { pc: proto.line_info.len() as u32, line });
        proto.line_info.push(ABS_LINE_INFO);
        *iwthabs = 0;
    } else {
        proto.line_info.push(delta as i8);
    }
    *last_line = line;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_info_round_trip() {
        let mut p = Proto::new();
        let lines = [1u32, 1, 2, 2, 3, 200, 200, 201, 5, 5];
        let mut last = 0;
        let mut iwthabs = 0;
        for &l in &lines {
            add_line_info(&mut p, &mut last, &mut iwthabs, l);
        }
        for (pc, &l) in lines.iter().enumerate() {
            assert_eq!(p.line_at(pc), l, "pc {}", pc);
        }
    }

    #[test]
    fn anchors_inserted_for_large_deltas() {
        let mut p = Proto::new();
        let mut last = 0;
        let mut iwthabs = 0;
        add_line_info(&mut p, &mut last, &mut iwthabs, 1);
        add_line_info(&mut p, &mut last, &mut iwthabs, 1000);
        assert!(!p.abs_line_info.is_empty());
        assert_eq!(p.line_at(1), 1000);
    }
}

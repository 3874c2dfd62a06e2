// Single-pass compiler: recursive descent over the token stream emitting
// bytecode directly, one FuncState per function nesting level. No AST is
// built; expressions travel as ExpDesc records until a context forces
// them into registers.

mod code;
mod expdesc;
mod expr;
mod lexer;
mod stmt;
mod token;

pub(crate) use expdesc::{ExpDesc, ExpKind, FoldValue, NO_JUMP};

use crate::gc::StringId;
use crate::limits::{MAX_REGS, MAX_VARS};
use crate::value::proto::UpvalDesc;
use crate::value::{LuaValue, Proto};
use crate::vm::LuaVM;
use ahash::RandomState;
use lexer::Lexer;
use smol_str::SmolStr;
use std::collections::HashMap;
use token::Token;

pub fn compile(vm: &mut LuaVM, source: &str, chunk_name: &str) -> Result<Proto, String> {
    let mut p = Parser::new(vm, source, chunk_name)?;
    p.main_chunk()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarKind {
    Regular,
    Const,
    Close,
}

pub(crate) struct VarDesc {
    pub name: SmolStr,
    pub kind: VarKind,
    pub ridx: u8,
}

/// One pending goto or one active label.
pub(crate) struct LabelDesc {
    pub name: SmolStr,
    /// Jump instruction (gotos) or code position (labels).
    pub pc: i32,
    pub line: u32,
    /// Active variables at the declaration point.
    pub nactvar: u8,
    /// Goto must close upvalues when resolved.
    pub close: bool,
}

pub(crate) struct BlockCnt {
    pub first_label: usize,
    pub first_goto: usize,
    pub nactvar: u8,
    /// Some variable of the block is captured by a closure.
    pub upval: bool,
    pub is_loop: bool,
    /// Inside the scope of a to-be-closed variable.
    pub inside_tbc: bool,
}

/// Constant-pool dedup key: tag plus bit-exact payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum KKey {
    Nil,
    Bool(bool),
    Int(i64),
    FloatBits(u64),
    Str(StringId),
}

pub(crate) struct FuncState {
    pub proto: Proto,
    pub kmap: HashMap<KKey, u32, RandomState>,
    /// Line-info emission state.
    pub prev_line: u32,
    pub iwthabs: u8,
    /// Position of the last jump target (prevents bad fold of jumps).
    pub last_target: i32,
    pub blocks: Vec<BlockCnt>,
    /// Index of this function's first entry in the shared actvar list.
    pub first_local: usize,
    pub first_label: usize,
    pub first_goto: usize,
    /// Count of active (register-bound) locals.
    pub nactvar: u8,
    pub freereg: u8,
    /// Some local of this function is captured: returns must close.
    pub needclose: bool,
}

impl FuncState {
    fn new(source: &str, line: u32) -> Self {
        let mut proto = Proto::new();
        proto.source = source.to_string();
        proto.line_defined = line;
        proto.max_stack_size = 2;
        FuncState {
            proto,
            kmap: HashMap::with_hasher(RandomState::new()),
            prev_line: line,
            iwthabs: 0,
            last_target: 0,
            blocks: Vec::new(),
            first_local: 0,
            first_label: 0,
            first_goto: 0,
            nactvar: 0,
            freereg: 0,
            needclose: false,
        }
    }

    pub fn pc(&self) -> i32 {
        self.proto.code.len() as i32
    }
}

pub(crate) struct Parser<'s> {
    pub lx: Lexer<'s>,
    vm: *mut LuaVM,
    pub fs: Vec<FuncState>,
    /// Active variable stack shared across nesting levels.
    pub actvar: Vec<VarDesc>,
    /// Pending gotos (including `break`).
    pub gotos: Vec<LabelDesc>,
    /// Active labels.
    pub labels: Vec<LabelDesc>,
}

impl<'s> Parser<'s> {
    fn new(vm: &mut LuaVM, source: &'s str, chunk_name: &str) -> Result<Self, String> {
        Ok(Parser {
            lx: Lexer::new(source, chunk_name)?,
            vm,
            fs: Vec::new(),
            actvar: Vec::new(),
            gotos: Vec::new(),
            labels: Vec::new(),
        })
    }

    pub(crate) fn vm(&mut self) -> &mut LuaVM {
        unsafe { &mut *self.vm }
    }

    /// Interns a string through the VM and returns its pool value.
    pub(crate) fn string_value(&mut self, bytes: &[u8]) -> LuaValue {
        self.vm().new_bytes(bytes)
    }

    pub(crate) fn str_id_value(&self, id: StringId) -> LuaValue {
        let short = unsafe { (*self.vm).pool.strings.get(id).is_short };
        if short { LuaValue::short_string(id) } else { LuaValue::long_string(id) }
    }

    #[inline]
    pub(crate) fn fs(&mut self) -> &mut FuncState {
        self.fs.last_mut().expect("no function state")
    }

    #[inline]
    pub(crate) fn fs_ref(&self) -> &FuncState {
        self.fs.last().expect("no function state")
    }

    pub(crate) fn line(&self) -> u32 {
        self.lx.token_line
    }

    // ---- token utilities ----

    pub(crate) fn check_next(&mut self, t: Token) -> Result<(), String> {
        if self.lx.token == t {
            self.lx.bump()
        } else {
            Err(self.lx.error_near(format!("{} expected", t.describe())))
        }
    }

    pub(crate) fn test_next(&mut self, t: &Token) -> Result<bool, String> {
        if &self.lx.token == t {
            self.lx.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn check_match(&mut self, what: Token, who: Token, line: u32) -> Result<(), String> {
        if self.lx.token == what {
            self.lx.bump()
        } else if line == self.lx.token_line {
            Err(self.lx.error_near(format!("{} expected", what.describe())))
        } else {
            Err(self.lx.error_near(format!(
                "{} expected (to close {} at line {})",
                what.describe(),
                who.describe(),
                line
            )))
        }
    }

    pub(crate) fn check_name(&mut self) -> Result<SmolStr, String> {
        match &self.lx.token {
            Token::Name(n) => {
                let n = n.clone();
                self.lx.bump()?;
                Ok(n)
            }
            _ => Err(self.lx.error_near("<name> expected")),
        }
    }

    // ---- function nesting ----

    pub(crate) fn open_func(&mut self, line: u32, is_vararg: bool) {
        let source = if let Some(outer) = self.fs.last() {
            outer.proto.source.clone()
        } else {
            self.lx.chunk_name.clone()
        };
        let mut fs = FuncState::new(&source, line);
        fs.proto.is_vararg = is_vararg;
        fs.first_local = self.actvar.len();
        fs.first_label = self.labels.len();
        fs.first_goto = self.gotos.len();
        self.fs.push(fs);
        self.enter_block(false);
    }

    /// Finishes the function under construction: final return, block
    /// teardown, unresolved-goto diagnostics.
    pub(crate) fn close_func(&mut self) -> Result<Proto, String> {
        let level = self.reg_level(self.fs_ref().nactvar);
        self.emit_return(level as u32, 0)?;
        self.leave_block()?;
        let fs = self.fs.pop().expect("unbalanced function nesting");
        self.actvar.truncate(fs.first_local);
        debug_assert!(self.labels.len() == fs.first_label);
        debug_assert!(self.gotos.len() == fs.first_goto);
        let mut proto = fs.proto;
        proto.last_line_defined = self.lx.token_line;
        proto.code.shrink_to_fit();
        proto.constants.shrink_to_fit();
        Ok(proto)
    }

    pub fn main_chunk(&mut self) -> Result<Proto, String> {
        self.open_func(0, true);
        // Every chunk closes over _ENV as its first upvalue.
        self.fs().proto.upvalues.push(UpvalDesc {
            name: SmolStr::new("_ENV"),
            in_stack: false,
            idx: 0,
        });
        self.emit_abc(crate::vm::OpCode::VarargPrep, 0, 0, 0)?;
        self.statlist()?;
        if self.lx.token != Token::Eof {
            return Err(self.lx.error_near("'<eof>' expected"));
        }
        self.close_func()
    }

    // ---- blocks ----

    pub(crate) fn enter_block(&mut self, is_loop: bool) {
        let inside_tbc =
            self.fs_ref().blocks.last().map(|b| b.inside_tbc).unwrap_or(false);
        let bl = BlockCnt {
            first_label: self.labels.len(),
            first_goto: self.gotos.len(),
            nactvar: self.fs_ref().nactvar,
            upval: false,
            is_loop,
            inside_tbc,
        };
        self.fs().blocks.push(bl);
    }

    pub(crate) fn leave_block(&mut self) -> Result<(), String> {
        let (nactvar, is_loop, upval, first_label, first_goto) = {
            let bl = self.fs_ref().blocks.last().expect("unbalanced block");
            (bl.nactvar, bl.is_loop, bl.upval, bl.first_label, bl.first_goto)
        };
        let stklevel = self.reg_level(nactvar);
        self.remove_vars(nactvar);
        self.fs().freereg = stklevel;
        let mut has_close = false;
        if is_loop {
            // Loop blocks give `break` its landing label; resolved while
            // this block is still current so only its own breaks match.
            has_close = self.create_label(SmolStr::new("break"), 0, false)?;
        }
        let depth = self.fs_ref().blocks.len();
        if !has_close && depth > 1 && upval {
            self.emit_abc(crate::vm::OpCode::Close, stklevel as u32, 0, 0)?;
        }
        self.fs().blocks.pop();
        self.labels.truncate(first_label);
        if depth > 1 {
            // Pending gotos defined here become the enclosing block's.
            for gt in &mut self.gotos[first_goto..] {
                if gt.nactvar > nactvar {
                    gt.close |= upval;
                    gt.nactvar = nactvar;
                }
            }
            Ok(())
        } else {
            // Function boundary: anything still pending is undefined.
            if self.gotos.len() > first_goto {
                let gt = &self.gotos[first_goto];
                return Err(if gt.name == "break" {
                    format!("{}:{}: break outside a loop", self.lx.chunk_name, gt.line)
                } else {
                    format!(
                        "{}:{}: no visible label '{}' for goto",
                        self.lx.chunk_name, gt.line, gt.name
                    )
                });
            }
            Ok(())
        }
    }

    // ---- local variables ----

    /// Register level below which `nactvar` variables live. One register
    /// per active variable.
    pub(crate) fn reg_level(&self, nactvar: u8) -> u8 {
        nactvar
    }

    /// Declares a local (not yet active/visible).
    pub(crate) fn new_localvar(&mut self, name: SmolStr, kind: VarKind) -> Result<usize, String> {
        let fs = self.fs_ref();
        if self.actvar.len() - fs.first_local >= MAX_VARS {
            return Err(self.lx.error("too many local variables"));
        }
        self.actvar.push(VarDesc { name, kind, ridx: 0 });
        Ok(self.actvar.len() - 1 - self.fs_ref().first_local)
    }

    /// Activates the last `n` declared locals, assigning registers.
    pub(crate) fn adjust_localvars(&mut self, n: usize) {
        let fs_first = self.fs_ref().first_local;
        let mut reglevel = self.reg_level(self.fs_ref().nactvar);
        for _ in 0..n {
            let vidx = self.fs_ref().nactvar as usize;
            self.fs().nactvar += 1;
            let var = &mut self.actvar[fs_first + vidx];
            var.ridx = reglevel;
            reglevel += 1;
            let name = var.name.clone();
            let start = self.fs_ref().proto.code.len() as u32;
            self.fs().proto.loc_vars.push(crate::value::proto::LocVar {
                name,
                start_pc: start,
                end_pc: 0,
            });
        }
    }

    pub(crate) fn remove_vars(&mut self, to_level: u8) {
        let fs_first = self.fs_ref().first_local;
        let pc = self.fs_ref().proto.code.len() as u32;
        while self.fs_ref().nactvar > to_level {
            self.fs().nactvar -= 1;
            let idx = fs_first + self.fs_ref().nactvar as usize;
            let name = self.actvar[idx].name.clone();
            // Close the debug range of the newest matching entry.
            for lv in self.fs().proto.loc_vars.iter_mut().rev() {
                if lv.end_pc == 0 && lv.name == name {
                    lv.end_pc = pc;
                    break;
                }
            }
            self.actvar.truncate(idx);
        }
    }

    pub(crate) fn var_desc(&self, fs_idx: usize, vidx: usize) -> &VarDesc {
        &self.actvar[self.fs[fs_idx].first_local + vidx]
    }

    // ---- name resolution ----

    /// Resolves `name` to a local, an upvalue, or a global access
    /// (`_ENV[name]`).
    pub(crate) fn single_var(&mut self, name: &SmolStr) -> Result<ExpDesc, String> {
        let level = self.fs.len() - 1;
        match self.resolve_var(level, name)? {
            Some(e) => Ok(e),
            None => {
                // Global: _ENV[name]; `indexed` picks the narrowest
                // access form and handles constant-pool overflow.
                let mut env = self
                    .resolve_var(level, &SmolStr::new("_ENV"))?
                    .expect("_ENV is always reachable");
                let v = self.string_value(name.as_bytes());
                let mut key = ExpDesc::new(ExpKind::KStr(v.as_string_id()));
                self.indexed(&mut env, &mut key)?;
                Ok(env)
            }
        }
    }

    /// Searches function level `fsl` (and recursively its enclosers) for
    /// `name`, adding upvalue descriptors along the way.
    fn resolve_var(&mut self, fsl: usize, name: &SmolStr) -> Result<Option<ExpDesc>, String> {
        // Local of this level?
        let fs = &self.fs[fsl];
        let first = fs.first_local;
        for vidx in (0..fs.nactvar as usize).rev() {
            let v = &self.actvar[first + vidx];
            if &v.name == name {
                return Ok(Some(ExpDesc::new(ExpKind::Local {
                    ridx: v.ridx as u32,
                    vidx: vidx as u32,
                })));
            }
        }
        // Existing upvalue of this level?
        for (i, u) in self.fs[fsl].proto.upvalues.iter().enumerate() {
            if &u.name == name {
                return Ok(Some(ExpDesc::new(ExpKind::Upval(i as u32))));
            }
        }
        if fsl == 0 {
            return Ok(None);
        }
        // Search outward, then capture.
        let Some(outer) = self.resolve_var(fsl - 1, name)? else {
            return Ok(None);
        };
        let desc = match outer.k {
            ExpKind::Local { ridx, vidx } => {
                self.mark_upval(fsl - 1, vidx as u8);
                UpvalDesc { name: name.clone(), in_stack: true, idx: ridx as u8 }
            }
            ExpKind::Upval(idx) => {
                UpvalDesc { name: name.clone(), in_stack: false, idx: idx as u8 }
            }
            _ => unreachable!("variable resolution yields locals or upvalues"),
        };
        let fs = &mut self.fs[fsl];
        if fs.proto.upvalues.len() >= crate::limits::MAX_UPVAL {
            return Err(self.lx.error("too many upvalues"));
        }
        fs.proto.upvalues.push(desc);
        Ok(Some(ExpDesc::new(ExpKind::Upval(fs.proto.upvalues.len() as u32 - 1))))
    }

    /// A block of `fs_idx` now has a captured variable; its exits must
    /// close upvalues.
    fn mark_upval(&mut self, fs_idx: usize, vidx: u8) {
        let fs = &mut self.fs[fs_idx];
        for bl in fs.blocks.iter_mut().rev() {
            if bl.nactvar <= vidx {
                bl.upval = true;
                break;
            }
        }
        fs.needclose = true;
    }

    // ---- labels & gotos ----

    /// Creates a label here; resolves matching pending gotos. Returns
    /// whether a CLOSE had to be emitted at the label.
    pub(crate) fn create_label(
        &mut self,
        name: SmolStr,
        line: u32,
        last: bool,
    ) -> Result<bool, String> {
        let level = if last {
            self.fs_ref().blocks.last().map(|b| b.nactvar).unwrap_or(0)
        } else {
            self.fs_ref().nactvar
        };
        let pc = self.get_label();
        let lb = LabelDesc { name, pc, line, nactvar: level, close: false };
        let needs_close = self.solve_gotos(&lb)?;
        self.labels.push(lb);
        if needs_close {
            let lvl = self.reg_level(level);
            self.emit_abc(crate::vm::OpCode::Close, lvl as u32, 0, 0)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Patches every pending goto in the current block that matches the
    /// new label. Returns whether any of them needs upvalue closing.
    fn solve_gotos(&mut self, lb: &LabelDesc) -> Result<bool, String> {
        let first = self.fs_ref().blocks.last().map(|b| b.first_goto).unwrap_or(0);
        let mut needs_close = false;
        let mut i = first;
        while i < self.gotos.len() {
            if self.gotos[i].name == lb.name {
                let gt = self.gotos.remove(i);
                if gt.nactvar < lb.nactvar {
                    let vname = self.actvar
                        [self.fs_ref().first_local + gt.nactvar as usize]
                        .name
                        .clone();
                    return Err(format!(
                        "{}:{}: <goto {}> jumps into the scope of local '{}'",
                        self.lx.chunk_name, gt.line, gt.name, vname
                    ));
                }
                needs_close |= gt.close;
                self.patch_list(gt.pc, lb.pc)?;
            } else {
                i += 1;
            }
        }
        Ok(needs_close)
    }

    /// `goto name` / `break`: backward jumps resolve at once; forward
    /// jumps go on the pending list.
    pub(crate) fn goto_stat(&mut self, name: SmolStr, line: u32) -> Result<(), String> {
        let found = self.labels[self.fs_ref().first_label..]
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| (l.pc, l.nactvar));
        match found {
            Some((target, lb_nactvar)) => {
                // Backward jump: leaving scopes may need a CLOSE.
                let here = self.reg_level(self.fs_ref().nactvar);
                let there = self.reg_level(lb_nactvar);
                if here > there && self.fs_ref().needclose {
                    self.emit_abc(crate::vm::OpCode::Close, there as u32, 0, 0)?;
                }
                let pc = self.emit_jump()?;
                self.patch_list(pc, target)?;
            }
            None => {
                let pc = self.emit_jump()?;
                let nactvar = self.fs_ref().nactvar;
                self.gotos.push(LabelDesc { name, pc, line, nactvar, close: false });
            }
        }
        Ok(())
    }

    pub(crate) fn label_stat(&mut self, name: SmolStr, line: u32) -> Result<(), String> {
        // Duplicate labels in the same function are errors.
        if self.labels[self.fs_ref().first_label..].iter().any(|l| l.name == name) {
            return Err(self
                .lx
                .error(format!("label '{}' already defined", name)));
        }
        // A label at the very end of its block sees the block's outer
        // variable level.
        let last = matches!(
            self.lx.token,
            Token::End | Token::Until | Token::Else | Token::Elseif | Token::Eof | Token::Return
        );
        self.create_label(name, line, last)?;
        Ok(())
    }

    // ---- register sanity ----

    pub(crate) fn check_reg_limit(&self, n: usize) -> Result<(), String> {
        if n >= MAX_REGS {
            Err(self.lx.error("function or expression needs too many registers"))
        } else {
            Ok(())
        }
    }
}

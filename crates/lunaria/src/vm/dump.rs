// Binary chunk format: a thin I/O pair over the in-memory Proto.
//
// Layout: signature, version/format pair, size bytes for the primitive
// types, an integer and a float canary to catch representation
// mismatches, the main chunk's upvalue count, then the recursive
// prototype encoding. Strings carry varint lengths; length 0 is the nil
// string, length 1 the empty string.

use crate::limits::{LuaFloat, LuaInt};
use crate::value::proto::{AbsLineInfo, LocVar, Proto, UpvalDesc};
use crate::value::tvalue::{self, LuaValue};
use crate::vm::{LuaError, LuaResult, LuaVM};
use smol_str::SmolStr;
use std::rc::Rc;

pub const SIGNATURE: &[u8; 4] = b"\x1bLua";
pub const VERSION: u8 = 0x55;
pub const FORMAT: u8 = 0;
const INT_CANARY: LuaInt = 0x5678;
const FLOAT_CANARY: LuaFloat = 370.5;

// Constant tags in the dump stream.
const TAG_NIL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x11;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x13;
const TAG_SHORT_STR: u8 = 0x04;
const TAG_LONG_STR: u8 = 0x14;

/// True when `data` starts with the binary chunk signature.
pub fn is_binary_chunk(data: &[u8]) -> bool {
    data.starts_with(SIGNATURE)
}

// ---- dumping ----

pub struct Dumper<'vm> {
    vm: &'vm LuaVM,
    out: Vec<u8>,
    strip: bool,
}

pub fn dump(vm: &LuaVM, proto: &Proto, strip: bool) -> Vec<u8> {
    let mut d = Dumper { vm, out: Vec::with_capacity(256), strip };
    d.header();
    d.byte(proto.upvalues.len() as u8);
    d.proto(proto, "");
    d.out
}

impl Dumper<'_> {
    fn header(&mut self) {
        self.out.extend_from_slice(SIGNATURE);
        self.byte(VERSION);
        self.byte(FORMAT);
        // Type widths, for a quick sanity check on load.
        self.byte(4); // instruction size
        self.byte(std::mem::size_of::<LuaInt>() as u8);
        self.byte(std::mem::size_of::<LuaFloat>() as u8);
        self.int(INT_CANARY);
        self.float(FLOAT_CANARY);
    }

    fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    /// Unsigned varint, 7 bits per byte, high bit marks the last one.
    fn varint(&mut self, mut v: u64) {
        loop {
            let mut b = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                b |= 0x80;
                self.byte(b);
                return;
            }
            self.byte(b);
        }
    }

    fn int(&mut self, i: LuaInt) {
        self.out.extend_from_slice(&i.to_le_bytes());
    }

    fn float(&mut self, f: LuaFloat) {
        self.out.extend_from_slice(&f.to_le_bytes());
    }

    /// Length-prefixed string: 0 is "no string", n+1 prefixes n bytes.
    fn string_opt(&mut self, s: Option<&[u8]>) {
        match s {
            None => self.varint(0),
            Some(bytes) => {
                self.varint(bytes.len() as u64 + 1);
                self.out.extend_from_slice(bytes);
            }
        }
    }

    fn proto(&mut self, p: &Proto, parent_source: &str) {
        if self.strip || p.source == parent_source {
            self.string_opt(None);
        } else {
            self.string_opt(Some(p.source.as_bytes()));
        }
        self.varint(p.line_defined as u64);
        self.varint(p.last_line_defined as u64);
        self.byte(p.num_params);
        self.byte(p.is_vararg as u8);
        self.byte(p.max_stack_size);

        self.varint(p.code.len() as u64);
        for &i in &p.code {
            self.out.extend_from_slice(&i.to_le_bytes());
        }

        self.varint(p.constants.len() as u64);
        for k in &p.constants {
            self.constant(k);
        }

        self.varint(p.upvalues.len() as u64);
        for u in &p.upvalues {
            self.byte(u.in_stack as u8);
            self.byte(u.idx);
        }

        self.varint(p.protos.len() as u64);
        for sub in &p.protos {
            self.proto(sub, &p.source);
        }

        // Debug block.
        if self.strip {
            self.varint(0); // line info
            self.varint(0); // absolute anchors
            self.varint(0); // locals
            self.varint(0); // upvalue names
        } else {
            self.varint(p.line_info.len() as u64);
            for &d in &p.line_info {
                self.byte(d as u8);
            }
            self.varint(p.abs_line_info.len() as u64);
            for a in &p.abs_line_info {
                self.varint(a.pc as u64);
                self.varint(a.line as u64);
            }
            self.varint(p.loc_vars.len() as u64);
            for lv in &p.loc_vars {
                self.string_opt(Some(lv.name.as_bytes()));
                self.varint(lv.start_pc as u64);
                self.varint(lv.end_pc as u64);
            }
            self.varint(p.upvalues.len() as u64);
            for u in &p.upvalues {
                self.string_opt(Some(u.name.as_bytes()));
            }
        }
    }

    fn constant(&mut self, k: &LuaValue) {
        match k.raw_tag() {
            tvalue::V_NIL => self.byte(TAG_NIL),
            tvalue::V_FALSE => self.byte(TAG_FALSE),
            tvalue::V_TRUE => self.byte(TAG_TRUE),
            tvalue::V_INT => {
                self.byte(TAG_INT);
                self.int(k.as_integer());
            }
            tvalue::V_FLT => {
                self.byte(TAG_FLOAT);
                self.float(k.as_float());
            }
            tvalue::V_SHRSTR | tvalue::V_LNGSTR => {
                let bytes = self.vm.pool.str_bytes(k.as_string_id()).to_vec();
                self.byte(if bytes.len() <= crate::limits::MAX_SHORT_LEN {
                    TAG_SHORT_STR
                } else {
                    TAG_LONG_STR
                });
                self.string_opt(Some(&bytes));
            }
            _ => unreachable!("non-constant value in constant pool"),
        }
    }
}

// ---- loading ----

pub struct Undumper<'vm, 'd> {
    vm: &'vm mut LuaVM,
    data: &'d [u8],
    pos: usize,
    chunk_name: String,
}

pub fn undump(vm: &mut LuaVM, data: &[u8], chunk_name: &str) -> LuaResult<Rc<Proto>> {
    let mut u = Undumper { vm, data, pos: 0, chunk_name: chunk_name.to_string() };
    match u.run() {
        Ok(p) => Ok(Rc::new(p)),
        Err(msg) => {
            let full = format!("{}: {}", chunk_name, msg);
            let v = u.vm.new_str(&full);
            u.vm.main_state().error_value = v;
            Err(LuaError::Syntax)
        }
    }
}

impl Undumper<'_, '_> {
    fn run(&mut self) -> Result<Proto, String> {
        self.check_header()?;
        let _main_upvals = self.byte()?;
        let name = self.chunk_name.clone();
        self.proto(&name)
    }

    fn check_header(&mut self) -> Result<(), String> {
        if !self.data[self.pos..].starts_with(SIGNATURE) {
            return Err("not a binary chunk".to_string());
        }
        self.pos += SIGNATURE.len();
        if self.byte()? != VERSION {
            return Err("version mismatch in binary chunk".to_string());
        }
        if self.byte()? != FORMAT {
            return Err("format mismatch in binary chunk".to_string());
        }
        if self.byte()? != 4
            || self.byte()? != std::mem::size_of::<LuaInt>() as u8
            || self.byte()? != std::mem::size_of::<LuaFloat>() as u8
        {
            return Err("type size mismatch in binary chunk".to_string());
        }
        if self.int()? != INT_CANARY {
            return Err("integer format mismatch in binary chunk".to_string());
        }
        if self.float()? != FLOAT_CANARY {
            return Err("float format mismatch in binary chunk".to_string());
        }
        Ok(())
    }

    fn byte(&mut self) -> Result<u8, String> {
        let b = *self.data.get(self.pos).ok_or("truncated binary chunk")?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&[u8], String> {
        if self.pos + n > self.data.len() {
            return Err("truncated binary chunk".to_string());
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn varint(&mut self) -> Result<u64, String> {
        let mut v: u64 = 0;
        let mut shift = 0;
        loop {
            let b = self.byte()?;
            v |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 != 0 {
                return Ok(v);
            }
            shift += 7;
            if shift >= 63 {
                return Err("overlong varint in binary chunk".to_string());
            }
        }
    }

    fn int(&mut self) -> Result<LuaInt, String> {
        let raw = self.bytes(std::mem::size_of::<LuaInt>())?;
        Ok(LuaInt::from_le_bytes(raw.try_into().unwrap()))
    }

    fn float(&mut self) -> Result<LuaFloat, String> {
        let raw = self.bytes(std::mem::size_of::<LuaFloat>())?;
        Ok(LuaFloat::from_le_bytes(raw.try_into().unwrap()))
    }

    fn string_opt(&mut self) -> Result<Option<Vec<u8>>, String> {
        let n = self.varint()?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.bytes(n as usize - 1)?.to_vec()))
    }

    fn proto(&mut self, parent_source: &str) -> Result<Proto, String> {
        let mut p = Proto::new();
        p.source = match self.string_opt()? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => parent_source.to_string(),
        };
        p.line_defined = self.varint()? as u32;
        p.last_line_defined = self.varint()? as u32;
        p.num_params = self.byte()?;
        p.is_vararg = self.byte()? != 0;
        p.max_stack_size = self.byte()?;

        let ncode = self.varint()? as usize;
        p.code.reserve(ncode);
        for _ in 0..ncode {
            let raw = self.bytes(4)?;
            p.code.push(u32::from_le_bytes(raw.try_into().unwrap()));
        }

        let nk = self.varint()? as usize;
        for _ in 0..nk {
            let k = self.constant()?;
            p.constants.push(k);
        }

        let nup = self.varint()? as usize;
        for _ in 0..nup {
            let in_stack = self.byte()? != 0;
            let idx = self.byte()?;
            p.upvalues.push(UpvalDesc { name: SmolStr::default(), in_stack, idx });
        }

        let nsub = self.varint()? as usize;
        let source = p.source.clone();
        for _ in 0..nsub {
            p.protos.push(Rc::new(self.proto(&source)?));
        }

        // Debug block.
        let nline = self.varint()? as usize;
        for _ in 0..nline {
            p.line_info.push(self.byte()? as i8);
        }
        let nabs = self.varint()? as usize;
        for _ in 0..nabs {
            let pc = self.varint()? as u32;
            let line = self.varint()? as u32;
            p.abs_line_info.push(AbsLineInfo { pc, line });
        }
        let nloc = self.varint()? as usize;
        for _ in 0..nloc {
            let name = self.string_opt()?.unwrap_or_default();
            let start_pc = self.varint()? as u32;
            let end_pc = self.varint()? as u32;
            p.loc_vars.push(LocVar {
                name: SmolStr::new(String::from_utf8_lossy(&name)),
                start_pc,
                end_pc,
            });
        }
        let nupnames = self.varint()? as usize;
        for i in 0..nupnames {
            if let Some(bytes) = self.string_opt()? {
                if let Some(u) = p.upvalues.get_mut(i) {
                    u.name = SmolStr::new(String::from_utf8_lossy(&bytes));
                }
            }
        }
        Ok(p)
    }

    fn constant(&mut self) -> Result<LuaValue, String> {
        Ok(match self.byte()? {
            TAG_NIL => LuaValue::nil(),
            TAG_FALSE => LuaValue::boolean(false),
            TAG_TRUE => LuaValue::boolean(true),
            TAG_INT => LuaValue::integer(self.int()?),
            TAG_FLOAT => LuaValue::float(self.float()?),
            TAG_SHORT_STR | TAG_LONG_STR => {
                let bytes =
                    self.string_opt()?.ok_or("missing string constant in binary chunk")?;
                self.vm.new_bytes(&bytes)
            }
            t => return Err(format!("unknown constant tag {:#x} in binary chunk", t)),
        })
    }
}

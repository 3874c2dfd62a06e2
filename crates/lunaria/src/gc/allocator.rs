// The allocation front door: every heap object is created here, born
// white, and charged against the collector's debt so allocation pressure
// drives collection steps.

use crate::gc::header::GcHeader;
use crate::gc::intern::StringArena;
use crate::gc::objects::{Closure, LuaClosure, NativeClosure, Upvalue};
use crate::gc::pool::{ClosureId, Pool, StringId, TableId, ThreadId, UdataId, UpvalId};
use crate::gc::Gc;
use crate::value::table::TableError;
use crate::value::{LuaTable, LuaValue, Proto, Udata};
use crate::vm::{CFunction, LuaState};
use std::any::Any;
use std::rc::Rc;

const CLOSURE_BASE_SIZE: usize = 64;
const UPVALUE_SIZE: usize = 48;
const UDATA_BASE_SIZE: usize = 64;
const THREAD_SIZE: usize = 2048;

pub struct ObjectPool {
    pub strings: StringArena,
    pub tables: Pool<LuaTable>,
    pub closures: Pool<Closure>,
    pub upvals: Pool<Upvalue>,
    pub udata: Pool<Udata>,
    pub threads: Pool<LuaState>,
}

impl ObjectPool {
    pub fn new() -> Self {
        ObjectPool {
            strings: StringArena::new(),
            tables: Pool::new(),
            closures: Pool::new(),
            upvals: Pool::new(),
            udata: Pool::new(),
            threads: Pool::new(),
        }
    }

    // ---- creation ----

    pub fn create_string(&mut self, gc: &mut Gc, bytes: &[u8]) -> LuaValue {
        let (id, short, newly, size) = self.strings.create(bytes, gc.current_white);
        if newly {
            gc.account_alloc(size);
        }
        if short { LuaValue::short_string(id) } else { LuaValue::long_string(id) }
    }

    pub fn create_str(&mut self, gc: &mut Gc, s: &str) -> LuaValue {
        self.create_string(gc, s.as_bytes())
    }

    pub fn create_table(&mut self, gc: &mut Gc, narray: usize, nhash: usize) -> LuaValue {
        let t = LuaTable::new(narray, nhash);
        let size = t.footprint();
        let id = self.tables.alloc(t, GcHeader::new(gc.current_white, size as u32));
        gc.account_alloc(size);
        LuaValue::table(TableId(id))
    }

    pub fn create_closure(
        &mut self,
        gc: &mut Gc,
        proto: Rc<Proto>,
        upvals: Vec<UpvalId>,
    ) -> LuaValue {
        let c = Closure::Lua(LuaClosure { proto, upvals });
        let size = c.footprint() + CLOSURE_BASE_SIZE;
        let id = self.closures.alloc(c, GcHeader::new(gc.current_white, size as u32));
        gc.account_alloc(size);
        LuaValue::closure(ClosureId(id))
    }

    pub fn create_native_closure(
        &mut self,
        gc: &mut Gc,
        f: CFunction,
        upvals: Vec<LuaValue>,
    ) -> LuaValue {
        let c = Closure::Native(NativeClosure { f, upvals });
        let size = c.footprint() + CLOSURE_BASE_SIZE;
        let id = self.closures.alloc(c, GcHeader::new(gc.current_white, size as u32));
        gc.account_alloc(size);
        LuaValue::closure(ClosureId(id))
    }

    pub fn create_upvalue_open(&mut self, gc: &mut Gc, thread: ThreadId, slot: usize) -> UpvalId {
        let id = self.upvals.alloc(
            Upvalue::Open { thread, slot },
            GcHeader::new(gc.current_white, UPVALUE_SIZE as u32),
        );
        gc.account_alloc(UPVALUE_SIZE);
        UpvalId(id)
    }

    pub fn create_upvalue_closed(&mut self, gc: &mut Gc, value: LuaValue) -> UpvalId {
        let id = self
            .upvals
            .alloc(Upvalue::Closed(value), GcHeader::new(gc.current_white, UPVALUE_SIZE as u32));
        gc.account_alloc(UPVALUE_SIZE);
        UpvalId(id)
    }

    pub fn create_userdata(&mut self, gc: &mut Gc, data: Box<dyn Any>, nuvalues: usize) -> LuaValue {
        let u = Udata::new(data, nuvalues);
        let size = UDATA_BASE_SIZE + nuvalues * std::mem::size_of::<LuaValue>();
        let id = self.udata.alloc(u, GcHeader::new(gc.current_white, size as u32));
        gc.account_alloc(size);
        LuaValue::userdata(UdataId(id))
    }

    pub fn create_thread(&mut self, gc: &mut Gc, state: LuaState) -> LuaValue {
        let id = self.threads.alloc(state, GcHeader::new(gc.current_white, THREAD_SIZE as u32));
        gc.account_alloc(THREAD_SIZE);
        let tid = ThreadId(id);
        self.threads.get_mut(id).expect("fresh thread").data.set_id(tid);
        LuaValue::thread(tid)
    }

    // ---- accessors (ids are trusted; a dangling id is a VM bug) ----

    #[inline(always)]
    pub fn table(&self, id: TableId) -> &LuaTable {
        &self.tables.get(id.0).expect("dangling table id").data
    }

    #[inline(always)]
    pub fn table_mut(&mut self, id: TableId) -> &mut LuaTable {
        &mut self.tables.get_mut(id.0).expect("dangling table id").data
    }

    #[inline(always)]
    pub fn closure(&self, id: ClosureId) -> &Closure {
        &self.closures.get(id.0).expect("dangling closure id").data
    }

    #[inline(always)]
    pub fn upval(&self, id: UpvalId) -> &Upvalue {
        &self.upvals.get(id.0).expect("dangling upvalue id").data
    }

    #[inline(always)]
    pub fn upval_mut(&mut self, id: UpvalId) -> &mut Upvalue {
        &mut self.upvals.get_mut(id.0).expect("dangling upvalue id").data
    }

    #[inline(always)]
    pub fn udata_ref(&self, id: UdataId) -> &Udata {
        &self.udata.get(id.0).expect("dangling userdata id").data
    }

    #[inline(always)]
    pub fn udata_mut(&mut self, id: UdataId) -> &mut Udata {
        &mut self.udata.get_mut(id.0).expect("dangling userdata id").data
    }

    #[inline(always)]
    pub fn thread(&self, id: ThreadId) -> &LuaState {
        &self.threads.get(id.0).expect("dangling thread id").data
    }

    /// Stable pointer to a pooled thread; used to run a coroutine while
    /// the pool stays reachable through the global state.
    pub(crate) fn thread_ptr(&mut self, id: ThreadId) -> *mut LuaState {
        let b = self.threads.raw_ptr(id.0).expect("dangling thread id");
        unsafe { &raw mut (*b).data }
    }

    // ---- string helpers ----

    #[inline]
    pub fn str_bytes(&self, id: StringId) -> &[u8] {
        self.strings.bytes(id)
    }

    pub fn str_utf8(&self, id: StringId) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.strings.bytes(id))
    }

    /// Value-level equality with long-string content comparison.
    pub fn values_equal(&self, a: &LuaValue, b: &LuaValue) -> bool {
        if a.is_string() && b.is_string() {
            self.strings.str_eq(a.as_string_id(), b.as_string_id())
        } else {
            crate::value::tvalue::raw_equal(a, b)
        }
    }

    // ---- table convenience (splits borrows between arena and tables) ----

    pub fn table_get(&self, id: TableId, key: &LuaValue) -> Option<LuaValue> {
        self.table(id).get(key, &self.strings)
    }

    pub fn table_get_int(&self, id: TableId, i: i64) -> Option<LuaValue> {
        self.table(id).get_int(i, &self.strings)
    }

    pub fn table_get_str(&self, id: TableId, key: StringId) -> Option<LuaValue> {
        let k = if self.strings.get(key).is_short {
            LuaValue::short_string(key)
        } else {
            LuaValue::long_string(key)
        };
        self.table(id).get(&k, &self.strings)
    }

    pub fn table_set(
        &mut self,
        id: TableId,
        key: &LuaValue,
        value: LuaValue,
    ) -> Result<bool, TableError> {
        let strings = &self.strings;
        let t = &mut self.tables.get_mut(id.0).expect("dangling table id").data;
        t.set(key, value, strings)
    }

    pub fn table_set_int(&mut self, id: TableId, i: i64, value: LuaValue) -> bool {
        let strings = &self.strings;
        let t = &mut self.tables.get_mut(id.0).expect("dangling table id").data;
        t.set_int(i, value, strings)
    }

    pub fn table_len(&self, id: TableId) -> i64 {
        self.table(id).len(&self.strings)
    }

    pub fn table_next(
        &self,
        id: TableId,
        key: Option<&LuaValue>,
    ) -> Result<Option<(LuaValue, LuaValue)>, TableError> {
        self.table(id).next(key, &self.strings)
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}

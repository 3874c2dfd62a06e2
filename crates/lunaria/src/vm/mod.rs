// Global VM state: the object pool, the collector, the registry and
// globals, per-base-type metatables, and the main thread. One LuaVM is
// one independent universe; values never cross between instances.

mod error;
pub(crate) mod execute;
mod frame;
pub mod opcode;
mod state;
pub mod dump;

pub use error::{LuaError, LuaFullError, LuaResult};
pub use execute::metamethods::TmKind;
pub use frame::{CallInfo, cist};
pub use opcode::{Instruction, OpCode};
pub use state::{LuaState, ThreadStatus};

use crate::compiler;
use crate::gc::{Gc, GcRef, ObjectPool, TableId, ThreadId};
use crate::limits::{DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STACK, MULTRET};
use crate::value::table::TableError;
use crate::value::tvalue::NUM_TYPES;
use crate::value::{LuaValue, Proto};
use std::rc::Rc;

/// Native function callable from Lua. Arguments arrive on the thread's
/// stack; the function pushes its results and returns how many.
pub type CFunction = fn(&mut LuaState) -> LuaResult<usize>;

fn default_panic(msg: &str) -> ! {
    panic!("unprotected error in Lua runtime: {}", msg)
}

fn default_warn(msg: &str) {
    eprintln!("Lua warning: {}", msg);
}

/// Build-time configuration, plumbed through `LuaVM::new`.
pub struct VmOptions {
    /// Hard cap on value-stack slots per thread.
    pub max_stack: usize,
    /// Hard cap on call-frame depth per thread.
    pub max_call_depth: usize,
    /// Legacy `__le`-from-`__lt` derivation (off by default).
    pub lt_for_le: bool,
    /// Called on unprotected errors and invariant breaches. Must not
    /// return.
    pub panic: fn(&str) -> !,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            max_stack: DEFAULT_MAX_STACK,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            lt_for_le: false,
            panic: default_panic,
        }
    }
}

pub struct LuaVM {
    pub pool: ObjectPool,
    pub gc: Gc,
    pub options: VmOptions,

    pub(crate) globals: LuaValue,
    pub(crate) registry: LuaValue,
    /// Metatables for non-table, non-userdata base types (strings mainly).
    pub(crate) type_mts: [Option<TableId>; NUM_TYPES as usize],
    pub(crate) main: ThreadId,

    /// Interned metamethod names, indexed by `TmKind`. Fixed objects.
    pub(crate) tm_names: Vec<LuaValue>,

    warn_fn: Box<dyn FnMut(&str)>,
    pub(crate) warn_enabled: bool,

    /// Generator behind `math.random`, reseedable from Lua.
    pub(crate) rng: rand::rngs::StdRng,
    /// Epoch for `os.clock`.
    pub(crate) start_time: std::time::Instant,
}

impl LuaVM {
    pub fn new(options: VmOptions) -> Box<LuaVM> {
        let mut vm = Box::new(LuaVM {
            pool: ObjectPool::new(),
            gc: Gc::new(),
            options,
            globals: LuaValue::nil(),
            registry: LuaValue::nil(),
            type_mts: [None; NUM_TYPES as usize],
            main: ThreadId(u32::MAX),
            tm_names: Vec::new(),
            warn_fn: Box::new(default_warn),
            warn_enabled: false,
            rng: rand::SeedableRng::from_entropy(),
            start_time: std::time::Instant::now(),
        });

        let vm_ptr: *mut LuaVM = &mut *vm;

        // Main thread lives in the pool like any other, pinned.
        let main_value = vm.pool.create_thread(&mut vm.gc, LuaState::new(vm_ptr, true));
        vm.main = main_value.as_thread_id();
        vm.fix_object(GcRef::Thread(vm.main));

        // Metamethod name strings, pinned for the VM's lifetime.
        vm.tm_names = TmKind::ALL
            .iter()
            .map(|tm| {
                let v = vm.pool.create_str(&mut vm.gc, tm.name());
                vm.fix_object(GcRef::Str(v.as_string_id()));
                v
            })
            .collect();
        vm.gc.tm_mode = vm.tm_names[TmKind::Mode as usize];
        vm.gc.tm_gc = vm.tm_names[TmKind::Gc as usize];

        // Registry anchors the globals table (and anything the host adds).
        vm.registry = vm.pool.create_table(&mut vm.gc, 4, 4);
        vm.globals = vm.pool.create_table(&mut vm.gc, 0, 32);
        let registry = vm.registry.as_table_id();
        vm.pool.table_set_int(registry, 1, main_value);
        let globals = vm.globals;
        vm.pool.table_set_int(registry, 2, globals);

        // _G points back at the globals table itself.
        vm.set_global("_G", globals);
        let version = vm.new_str(crate::LUA_VERSION);
        vm.set_global("_VERSION", version);

        vm
    }

    fn fix_object(&mut self, r: GcRef) {
        match r {
            GcRef::Str(id) => {
                if let Some(b) = self.pool.strings.pool.get_mut(id.0) {
                    b.header.set_fixed();
                }
            }
            GcRef::Thread(id) => {
                if let Some(b) = self.pool.threads.get_mut(id.0) {
                    b.header.set_fixed();
                }
            }
            _ => {}
        }
    }

    // ---- thread access ----

    pub fn main_state(&mut self) -> &mut LuaState {
        let ptr = self.pool.thread_ptr(self.main);
        unsafe { &mut *ptr }
    }

    pub fn main_state_ref(&self) -> &LuaState {
        self.pool.thread(self.main)
    }

    // ---- allocation shorthands ----

    #[inline]
    pub fn new_str(&mut self, s: &str) -> LuaValue {
        self.pool.create_str(&mut self.gc, s)
    }

    #[inline]
    pub fn new_bytes(&mut self, b: &[u8]) -> LuaValue {
        self.pool.create_string(&mut self.gc, b)
    }

    #[inline]
    pub fn new_table(&mut self, narray: usize, nhash: usize) -> LuaValue {
        self.pool.create_table(&mut self.gc, narray, nhash)
    }

    #[inline]
    pub fn new_native(&mut self, f: CFunction) -> LuaValue {
        LuaValue::cfunction(f)
    }

    pub fn new_native_closure(&mut self, f: CFunction, upvals: Vec<LuaValue>) -> LuaValue {
        self.pool.create_native_closure(&mut self.gc, f, upvals)
    }

    // ---- raw table access with barriers ----

    pub fn raw_get(&self, t: TableId, key: &LuaValue) -> Option<LuaValue> {
        self.pool.table_get(t, key)
    }

    pub fn raw_set(
        &mut self,
        t: TableId,
        key: &LuaValue,
        value: LuaValue,
    ) -> Result<(), TableError> {
        let new_key = self.pool.table_set(t, key, value)?;
        if (new_key && key.is_collectable()) || value.is_collectable() {
            self.gc.barrier_back(&mut self.pool, t);
        }
        Ok(())
    }

    pub fn raw_seti(&mut self, t: TableId, i: i64, value: LuaValue) {
        self.pool.table_set_int(t, i, value);
        if value.is_collectable() {
            self.gc.barrier_back(&mut self.pool, t);
        }
    }

    // ---- globals ----

    pub fn get_global(&mut self, name: &str) -> LuaValue {
        let key = self.new_str(name);
        self.pool.table_get(self.globals.as_table_id(), &key).unwrap_or(LuaValue::nil())
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) {
        let key = self.new_str(name);
        let g = self.globals.as_table_id();
        let _ = self.raw_set(g, &key, value);
    }

    pub fn globals_table(&self) -> TableId {
        self.globals.as_table_id()
    }

    pub fn registry_table(&self) -> TableId {
        self.registry.as_table_id()
    }

    // ---- metatables ----

    /// The metatable governing `v`, if any.
    pub fn metatable_of(&self, v: &LuaValue) -> Option<TableId> {
        if v.is_table() {
            self.pool.table(v.as_table_id()).metatable
        } else if v.is_full_userdata() {
            self.pool.udata_ref(v.as_udata_id()).metatable
        } else {
            self.type_mts[v.base_type() as usize]
        }
    }

    /// Attaches a metatable; registers the object for finalization when
    /// the metatable carries `__gc`.
    pub fn set_metatable(&mut self, target: &LuaValue, mt: Option<TableId>) {
        if target.is_table() {
            self.pool.table_mut(target.as_table_id()).metatable = mt;
        } else if target.is_full_userdata() {
            self.pool.udata_mut(target.as_udata_id()).metatable = mt;
        } else {
            self.type_mts[target.base_type() as usize] = mt;
            return;
        }
        if let Some(mt) = mt {
            let mtv = LuaValue::table(mt);
            if let Some(owner) = GcRef::of_value(target) {
                self.gc.barrier_forward(&mut self.pool, owner, &mtv);
            }
            let has_gc = self.pool.table_get(mt, &self.gc.tm_gc.clone()).is_some();
            if has_gc {
                if let Some(r) = GcRef::of_value(target) {
                    self.gc.mark_finalizable(&mut self.pool, r);
                }
            }
        }
    }

    /// Metamethod lookup through the absence cache: a set bit on the
    /// metatable means "known absent", so the fast path skips the query.
    pub fn fast_metamethod(&self, mt: TableId, tm: TmKind) -> Option<LuaValue> {
        let t = self.pool.table(mt);
        if tm.cacheable() && t.flags.get() & (1 << tm as u8) != 0 {
            return None;
        }
        let name = self.tm_names[tm as usize];
        match self.pool.table_get(mt, &name) {
            Some(v) => Some(v),
            None => {
                if tm.cacheable() {
                    t.flags.set(t.flags.get() | (1 << tm as u8));
                }
                None
            }
        }
    }

    // ---- GC orchestration ----

    pub(crate) fn gc_roots(&self) -> Vec<LuaValue> {
        let mut roots = vec![self.globals, self.registry, LuaValue::thread(self.main)];
        for mt in self.type_mts.iter().flatten() {
            roots.push(LuaValue::table(*mt));
        }
        roots
    }

    /// Complete collection cycle (collectgarbage "collect").
    pub fn collect_garbage(&mut self) {
        let roots = self.gc_roots();
        let signal = self.gc.full_collection(&mut self.pool, &roots);
        if signal == crate::gc::GcSignal::RunFinalizers {
            self.run_pending_finalizers();
        }
    }

    /// One collector step regardless of debt (collectgarbage "step").
    pub fn collect_step(&mut self) {
        let roots = self.gc_roots();
        let signal = self.gc.step(&mut self.pool, &roots);
        if signal == crate::gc::GcSignal::RunFinalizers {
            self.run_pending_finalizers();
        }
    }

    pub(crate) fn run_pending_finalizers(&mut self) {
        let ptr = self.pool.thread_ptr(self.main);
        let l = unsafe { &mut *ptr };
        l.run_finalizers();
    }

    // ---- warnings ----

    pub fn warn(&mut self, msg: &str) {
        if self.warn_enabled {
            (self.warn_fn)(msg);
        }
    }

    /// Always-on channel for internal reports (finalizer errors).
    pub fn warn_always(&mut self, msg: &str) {
        (self.warn_fn)(msg);
    }

    pub fn set_warn_fn(&mut self, f: Box<dyn FnMut(&str)>) {
        self.warn_fn = f;
    }

    pub fn set_warnings_enabled(&mut self, on: bool) {
        self.warn_enabled = on;
    }

    // ---- compile & run ----

    pub fn compile(&mut self, source: &str) -> LuaResult<Rc<Proto>> {
        self.compile_with_name(source, "=stdin")
    }

    pub fn compile_with_name(&mut self, source: &str, chunk_name: &str) -> LuaResult<Rc<Proto>> {
        match compiler::compile(self, source, chunk_name) {
            Ok(p) => Ok(Rc::new(p)),
            Err(msg) => {
                let v = self.new_str(&msg);
                self.main_state().error_value = v;
                Err(LuaError::Syntax)
            }
        }
    }

    /// Wraps a compiled chunk in a closure whose first upvalue is the
    /// globals table (`_ENV`).
    pub fn make_chunk_closure(&mut self, proto: Rc<Proto>) -> LuaValue {
        let globals = self.globals;
        let env = self.pool.create_upvalue_closed(&mut self.gc, globals);
        self.pool.create_closure(&mut self.gc, proto, vec![env])
    }

    pub fn execute_proto(&mut self, proto: Rc<Proto>) -> LuaResult<Vec<LuaValue>> {
        let f = self.make_chunk_closure(proto);
        self.call_function(f, &[])
    }

    pub fn execute_string(&mut self, source: &str) -> LuaResult<Vec<LuaValue>> {
        let proto = self.compile_with_name(source, "=chunk")?;
        self.execute_proto(proto)
    }

    /// Calls a function on the main thread, unprotected.
    pub fn call_function(&mut self, f: LuaValue, args: &[LuaValue]) -> LuaResult<Vec<LuaValue>> {
        let ptr = self.pool.thread_ptr(self.main);
        let l = unsafe { &mut *ptr };
        l.call_value(f, args, MULTRET)
    }

    /// Protected call on the main thread: `(true, results)` or
    /// `(false, [error value])`.
    pub fn protected_call(
        &mut self,
        f: LuaValue,
        args: &[LuaValue],
    ) -> LuaResult<(bool, Vec<LuaValue>)> {
        let ptr = self.pool.thread_ptr(self.main);
        let l = unsafe { &mut *ptr };
        match l.call_value_protected(f, args) {
            Ok(vals) => Ok((true, vals)),
            Err(LuaError::Yield) => Err(LuaError::Yield),
            Err(_) => Ok((false, vec![l.error_object()])),
        }
    }

    /// Pairs an error kind with its rendered message for the host.
    pub fn into_full_error(&self, kind: LuaError) -> LuaFullError {
        let message = match kind {
            LuaError::Memory => "not enough memory".to_string(),
            _ => self.main_state_ref().error_message(),
        };
        LuaFullError { kind, message }
    }

    pub fn error_message(&self) -> String {
        self.main_state_ref().error_message()
    }

    // ---- coroutines ----

    /// Opens the standard library set into the globals table.
    pub fn open_stdlib(&mut self, which: crate::stdlib::Stdlib) -> LuaResult<()> {
        crate::stdlib::open(self, which)
    }

    /// Creates a suspended coroutine running `f`.
    pub fn new_coroutine(&mut self, f: LuaValue) -> LuaValue {
        let vm_ptr: *mut LuaVM = self;
        let mut st = LuaState::new(vm_ptr, false);
        st.stack[0] = f;
        st.top = 1;
        self.pool.create_thread(&mut self.gc, st)
    }
}

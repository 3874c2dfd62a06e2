// Incremental tri-color mark-and-sweep with a generational overlay.
//
// One mutator, one collector, interleaved on the same thread. The cycle:
//
//   Pause -> Propagate -> Atomic -> Sweep -> CallFin -> Pause
//
// Propagate and Sweep are resumable in bounded quanta; Atomic runs weak
// table clearing, the ephemeron fixpoint, open-upvalue remarking, and
// finalizer separation indivisibly. Allocation accumulates debt; crossing
// zero makes the next safepoint perform a step.

mod allocator;
mod header;
mod intern;
mod objects;
mod pool;

pub use allocator::ObjectPool;
pub use header::{G_NEW, G_OLD, G_SURVIVAL, GcHeader};
pub use intern::{LuaStr, StringArena};
pub use objects::{Closure, LuaClosure, NativeClosure, Upvalue};
pub use pool::{ClosureId, GcBox, Pool, StringId, TableId, ThreadId, UdataId, UpvalId};

use crate::value::LuaValue;
use crate::value::proto::Proto;

/// Default collector parameters (percentages, bytes).
const DEFAULT_PAUSE: i32 = 200; // start next cycle at 2x live size
const DEFAULT_STEPMUL: i32 = 200;
const DEFAULT_STEPSIZE_KB: i32 = 13;
const DEFAULT_MINORMUL: i32 = 25;
/// Sweep this many slots per sweep quantum.
const SWEEP_QUANTUM: usize = 100;
/// Minor collections per forced major collection.
const MINOR_PER_MAJOR: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// Pure incremental mark-and-sweep.
    Incremental,
    /// Generational: frequent minor collections over young objects,
    /// falling back to a full cycle on promotion pressure.
    Generational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    Atomic,
    Sweep,
    CallFin,
}

/// What a finished step asks the caller (the VM) to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcSignal {
    None,
    /// tobefnz is non-empty: dispatch finalizers from the main thread.
    RunFinalizers,
}

/// A reference to any pooled object, for gray lists and sweep bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRef {
    Str(StringId),
    Table(TableId),
    Closure(ClosureId),
    Upval(UpvalId),
    Udata(UdataId),
    Thread(ThreadId),
}

impl GcRef {
    pub fn of_value(v: &LuaValue) -> Option<GcRef> {
        use crate::value::tvalue::*;
        Some(match v.raw_tag() {
            V_SHRSTR | V_LNGSTR => GcRef::Str(v.as_string_id()),
            V_TABLE => GcRef::Table(v.as_table_id()),
            V_CLOSURE => GcRef::Closure(v.as_closure_id()),
            V_USERDATA => GcRef::Udata(v.as_udata_id()),
            V_THREAD => GcRef::Thread(v.as_thread_id()),
            _ => return None,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub cycles: usize,
    pub minor_collections: usize,
    pub objects_collected: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
}

pub struct GcParams {
    pub pause: i32,
    pub stepmul: i32,
    pub stepsize_kb: i32,
    pub minormul: i32,
}

impl Default for GcParams {
    fn default() -> Self {
        GcParams {
            pause: DEFAULT_PAUSE,
            stepmul: DEFAULT_STEPMUL,
            stepsize_kb: DEFAULT_STEPSIZE_KB,
            minormul: DEFAULT_MINORMUL,
        }
    }
}

pub struct Gc {
    pub current_white: u8,
    pub state: GcState,
    pub kind: GcKind,

    /// Bytes allocated but not yet paid for; > 0 means a step is due.
    pub debt: isize,
    pub total_bytes: isize,
    marked_bytes: isize,

    pub stopped: bool,
    in_collector: bool,

    pub params: GcParams,
    pub stats: GcStats,

    gray: Vec<GcRef>,
    grayagain: Vec<GcRef>,

    // Weak-table lists, rebuilt each cycle during traversal.
    weak_values: Vec<TableId>,
    ephemerons: Vec<TableId>,
    all_weak: Vec<TableId>,

    /// Objects separated for finalization, still alive.
    finobj: Vec<GcRef>,
    /// Unreachable finalizable objects awaiting their `__gc` call.
    tobefnz: Vec<GcRef>,

    /// Resumable sweep position: (pool ordinal, slot index).
    sweep_pool: usize,
    sweep_slot: usize,

    minor_count: u32,

    /// Interned "__mode" and "__gc" keys, installed by the VM at boot.
    pub(crate) tm_mode: LuaValue,
    pub(crate) tm_gc: LuaValue,
}

impl Gc {
    pub fn new() -> Self {
        Gc {
            current_white: 0,
            state: GcState::Pause,
            kind: GcKind::Incremental,
            debt: -(DEFAULT_STEPSIZE_KB as isize * 1024),
            total_bytes: 0,
            marked_bytes: 0,
            stopped: false,
            in_collector: false,
            params: GcParams::default(),
            stats: GcStats::default(),
            gray: Vec::with_capacity(64),
            grayagain: Vec::with_capacity(16),
            weak_values: Vec::new(),
            ephemerons: Vec::new(),
            all_weak: Vec::new(),
            finobj: Vec::new(),
            tobefnz: Vec::new(),
            sweep_pool: 0,
            sweep_slot: 0,
            minor_count: 0,
            tm_mode: LuaValue::nil(),
            tm_gc: LuaValue::nil(),
        }
    }

    // ---- accounting ----

    #[inline]
    pub fn account_alloc(&mut self, size: usize) {
        self.total_bytes += size as isize;
        self.debt += size as isize;
        self.stats.bytes_allocated += size;
    }

    #[inline]
    fn account_free(&mut self, size: usize) {
        self.total_bytes -= size as isize;
        self.stats.bytes_freed += size;
        self.stats.objects_collected += 1;
    }

    #[inline]
    pub fn should_collect(&self) -> bool {
        self.debt > 0 && !self.stopped
    }

    /// Re-bases the debt (negative debt is allocation credit).
    pub fn set_debt(&mut self, debt: isize) {
        self.debt = debt;
    }

    /// Heap size for `collectgarbage("count")`, in bytes.
    pub fn heap_bytes(&self) -> usize {
        self.total_bytes.max(0) as usize
    }

    // ---- stepping ----

    /// One collection step driven by debt. `roots` must cover every value
    /// the mutator can still reach outside the heap graph.
    pub fn step(&mut self, pool: &mut ObjectPool, roots: &[LuaValue]) -> GcSignal {
        if self.in_collector {
            return GcSignal::None;
        }
        self.in_collector = true;
        let signal = match self.kind {
            GcKind::Generational if self.state == GcState::Pause => {
                let sig = self.minor_collection(pool, roots);
                self.set_debt(-(self.minor_debt_credit()));
                sig
            }
            _ => self.incremental_step(pool, roots),
        };
        self.in_collector = false;
        signal
    }

    /// Runs a complete cycle, ignoring budgets.
    pub fn full_collection(&mut self, pool: &mut ObjectPool, roots: &[LuaValue]) -> GcSignal {
        if self.in_collector {
            return GcSignal::None;
        }
        self.in_collector = true;
        // Finish an in-flight cycle first so every object gets a fresh
        // look at reachability.
        if self.state != GcState::Pause {
            while self.state != GcState::Pause {
                self.single_step(pool, roots, true);
            }
        }
        let mut signal = GcSignal::None;
        loop {
            self.single_step(pool, roots, true);
            if !self.tobefnz.is_empty() {
                signal = GcSignal::RunFinalizers;
            }
            if self.state == GcState::Pause {
                break;
            }
        }
        self.set_pause_debt();
        self.in_collector = false;
        signal
    }

    fn incremental_step(&mut self, pool: &mut ObjectPool, roots: &[LuaValue]) -> GcSignal {
        let stepsize = self.params.stepsize_kb as isize * 1024;
        let mut work = self.debt * self.params.stepmul as isize / 100;
        let mut signal = GcSignal::None;
        loop {
            let done = self.single_step(pool, roots, false);
            work -= done;
            if !self.tobefnz.is_empty() {
                signal = GcSignal::RunFinalizers;
            }
            if self.state == GcState::Pause {
                self.set_pause_debt();
                return signal;
            }
            if work <= 0 {
                self.set_debt(-stepsize);
                return signal;
            }
        }
    }

    /// One state-machine transition; returns work performed.
    fn single_step(&mut self, pool: &mut ObjectPool, roots: &[LuaValue], fast: bool) -> isize {
        match self.state {
            GcState::Pause => {
                self.restart_cycle(pool, roots);
                self.state = GcState::Propagate;
                roots.len() as isize + 1
            }
            GcState::Propagate => {
                if self.gray.is_empty() {
                    self.state = GcState::Atomic;
                    1
                } else if fast {
                    let mut work = 0;
                    while !self.gray.is_empty() {
                        work += self.propagate_one(pool);
                    }
                    work
                } else {
                    self.propagate_one(pool)
                }
            }
            GcState::Atomic => {
                let work = self.atomic(pool, roots);
                self.state = GcState::Sweep;
                self.sweep_pool = 0;
                self.sweep_slot = 0;
                work
            }
            GcState::Sweep => {
                let quantum = if fast { usize::MAX } else { SWEEP_QUANTUM };
                if self.sweep_quantum(pool, quantum) {
                    self.state = GcState::CallFin;
                }
                SWEEP_QUANTUM as isize
            }
            GcState::CallFin => {
                // The VM drains tobefnz; the cycle itself is over.
                self.state = GcState::Pause;
                self.stats.cycles += 1;
                1
            }
        }
    }

    fn set_pause_debt(&mut self) {
        let estimate = self.marked_bytes.max(1024);
        let threshold = estimate * self.params.pause as isize / 100;
        self.set_debt(self.total_bytes - threshold);
    }

    fn minor_debt_credit(&self) -> isize {
        (self.marked_bytes.max(64 * 1024) * self.params.minormul as isize) / 100
    }

    // ---- cycle start ----

    fn restart_cycle(&mut self, pool: &mut ObjectPool, roots: &[LuaValue]) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak_values.clear();
        self.ephemerons.clear();
        self.all_weak.clear();
        self.marked_bytes = 0;
        self.whiten_all(pool);
        for v in roots {
            self.mark_value(pool, v);
        }
        // Objects awaiting their finalizer stay alive until it has run,
        // even across cycles started from inside a finalizer.
        let pending = self.tobefnz.clone();
        for r in pending {
            self.mark_object(pool, r);
        }
    }

    fn whiten_all(&mut self, pool: &mut ObjectPool) {
        let w = self.current_white;
        for (_, b) in pool.strings.pool.iter_mut() {
            if !b.header.is_fixed() {
                b.header.make_white(w);
            }
        }
        for (_, b) in pool.tables.iter_mut() {
            if !b.header.is_fixed() {
                b.header.make_white(w);
            }
        }
        for (_, b) in pool.closures.iter_mut() {
            if !b.header.is_fixed() {
                b.header.make_white(w);
            }
        }
        for (_, b) in pool.upvals.iter_mut() {
            if !b.header.is_fixed() {
                b.header.make_white(w);
            }
        }
        for (_, b) in pool.udata.iter_mut() {
            if !b.header.is_fixed() {
                b.header.make_white(w);
            }
        }
        for (_, b) in pool.threads.iter_mut() {
            if !b.header.is_fixed() {
                b.header.make_white(w);
            }
        }
    }

    // ---- marking ----

    fn header_mut<'p>(pool: &'p mut ObjectPool, r: GcRef) -> Option<&'p mut GcHeader> {
        match r {
            GcRef::Str(id) => pool.strings.pool.get_mut(id.0).map(|b| &mut b.header),
            GcRef::Table(id) => pool.tables.get_mut(id.0).map(|b| &mut b.header),
            GcRef::Closure(id) => pool.closures.get_mut(id.0).map(|b| &mut b.header),
            GcRef::Upval(id) => pool.upvals.get_mut(id.0).map(|b| &mut b.header),
            GcRef::Udata(id) => pool.udata.get_mut(id.0).map(|b| &mut b.header),
            GcRef::Thread(id) => pool.threads.get_mut(id.0).map(|b| &mut b.header),
        }
    }

    fn header<'p>(pool: &'p ObjectPool, r: GcRef) -> Option<&'p GcHeader> {
        match r {
            GcRef::Str(id) => pool.strings.pool.get(id.0).map(|b| &b.header),
            GcRef::Table(id) => pool.tables.get(id.0).map(|b| &b.header),
            GcRef::Closure(id) => pool.closures.get(id.0).map(|b| &b.header),
            GcRef::Upval(id) => pool.upvals.get(id.0).map(|b| &b.header),
            GcRef::Udata(id) => pool.udata.get(id.0).map(|b| &b.header),
            GcRef::Thread(id) => pool.threads.get(id.0).map(|b| &b.header),
        }
    }

    fn is_marked(pool: &ObjectPool, r: GcRef) -> bool {
        Self::header(pool, r).map(|h| !h.is_white()).unwrap_or(true)
    }

    #[inline]
    fn mark_value(&mut self, pool: &mut ObjectPool, v: &LuaValue) {
        if let Some(r) = GcRef::of_value(v) {
            self.mark_object(pool, r);
        }
    }

    /// White -> gray (or straight to black for leaf objects).
    fn mark_object(&mut self, pool: &mut ObjectPool, r: GcRef) {
        let Some(h) = Self::header_mut(pool, r) else { return };
        if !h.is_white() {
            return;
        }
        match r {
            GcRef::Str(_) => {
                // Leaves: nothing to scan.
                self.marked_bytes += h.size as isize;
                h.make_black();
            }
            _ => {
                h.make_gray();
                self.gray.push(r);
            }
        }
    }

    fn propagate_one(&mut self, pool: &mut ObjectPool) -> isize {
        match self.gray.pop() {
            Some(r) => self.traverse(pool, r),
            None => 0,
        }
    }

    /// Gray -> black: scan all referents.
    fn traverse(&mut self, pool: &mut ObjectPool, r: GcRef) -> isize {
        if let Some(h) = Self::header_mut(pool, r) {
            self.marked_bytes += h.size as isize;
            h.make_black();
        } else {
            return 0;
        }
        match r {
            GcRef::Str(_) => 1,
            GcRef::Table(id) => self.traverse_table(pool, id),
            GcRef::Closure(id) => self.traverse_closure(pool, id),
            GcRef::Upval(id) => self.traverse_upvalue(pool, id),
            GcRef::Udata(id) => self.traverse_udata(pool, id),
            GcRef::Thread(id) => {
                let work = self.traverse_thread(pool, id);
                // Thread stacks mutate without barriers; a thread stays
                // gray during propagation and is rescanned at atomic.
                if self.state == GcState::Propagate {
                    if let Some(h) = Self::header_mut(pool, r) {
                        h.make_gray();
                    }
                    if !self.grayagain.contains(&r) {
                        self.grayagain.push(r);
                    }
                }
                work
            }
        }
    }

    fn traverse_table(&mut self, pool: &mut ObjectPool, id: TableId) -> isize {
        let (metatable, weak_keys, weak_values) = {
            let Some(b) = pool.tables.get(id.0) else { return 0 };
            let mt = b.data.metatable;
            match mt {
                None => (None, false, false),
                Some(mtid) => {
                    let mode = pool.table_get(mtid, &self.tm_mode);
                    let (mut wk, mut wv) = (false, false);
                    if let Some(m) = mode {
                        if m.is_string() {
                            for &c in pool.str_bytes(m.as_string_id()) {
                                if c == b'k' {
                                    wk = true;
                                } else if c == b'v' {
                                    wv = true;
                                }
                            }
                        }
                    }
                    (Some(mtid), wk, wv)
                }
            }
        };
        if let Some(mt) = metatable {
            self.mark_object(pool, GcRef::Table(mt));
        }

        if !weak_keys && !weak_values {
            // Strong table: mark every live key and value.
            let mut to_mark = Vec::new();
            {
                let b = pool.tables.get(id.0).expect("traversed table vanished");
                for v in b.data.array_values() {
                    to_mark.push(*v);
                }
                for (k, v) in b.data.entries_raw() {
                    if !v.is_empty() {
                        to_mark.push(*k);
                        to_mark.push(*v);
                    }
                }
            }
            let n = to_mark.len() as isize;
            for v in &to_mark {
                self.mark_value(pool, v);
            }
            return 1 + n;
        }

        if weak_keys && weak_values {
            self.all_weak.push(id);
            return 1;
        }
        if weak_values {
            // Keys are strong; values wait for the atomic clearing pass.
            let mut keys = Vec::new();
            {
                let b = pool.tables.get(id.0).expect("traversed table vanished");
                for (k, v) in b.data.entries_raw() {
                    if !v.is_empty() {
                        keys.push(*k);
                    }
                }
            }
            for k in &keys {
                self.mark_value(pool, k);
            }
            self.weak_values.push(id);
            return 1 + keys.len() as isize;
        }
        // Ephemeron: values are reachable only through reachable keys;
        // resolved to a fixpoint during the atomic phase.
        self.ephemerons.push(id);
        1
    }

    fn traverse_closure(&mut self, pool: &mut ObjectPool, id: ClosureId) -> isize {
        enum Refs {
            Lua(Vec<UpvalId>, std::rc::Rc<Proto>),
            Native(Vec<LuaValue>),
        }
        let refs = {
            let Some(b) = pool.closures.get(id.0) else { return 0 };
            match &b.data {
                Closure::Lua(c) => Refs::Lua(c.upvals.clone(), c.proto.clone()),
                Closure::Native(c) => Refs::Native(c.upvals.clone()),
            }
        };
        match refs {
            Refs::Lua(upvals, proto) => {
                let mut work = 1 + upvals.len() as isize;
                for u in upvals {
                    self.mark_object(pool, GcRef::Upval(u));
                }
                work += self.mark_proto_constants(pool, &proto);
                work
            }
            Refs::Native(upvals) => {
                for v in &upvals {
                    self.mark_value(pool, v);
                }
                1 + upvals.len() as isize
            }
        }
    }

    /// Prototypes are plain shared data; their string/constant payloads
    /// are kept alive through any closure that uses them.
    fn mark_proto_constants(&mut self, pool: &mut ObjectPool, proto: &Proto) -> isize {
        let mut work = proto.constants.len() as isize;
        for k in &proto.constants {
            self.mark_value(pool, k);
        }
        for child in &proto.protos {
            work += self.mark_proto_constants(pool, child);
        }
        work
    }

    fn traverse_upvalue(&mut self, pool: &mut ObjectPool, id: UpvalId) -> isize {
        let closed = {
            let Some(b) = pool.upvals.get(id.0) else { return 0 };
            match &b.data {
                Upvalue::Closed(v) => Some(*v),
                // Open: the value lives in a thread stack and is reached
                // through that thread (or the atomic remark pass).
                Upvalue::Open { .. } => None,
            }
        };
        if let Some(v) = closed {
            self.mark_value(pool, &v);
        }
        1
    }

    fn traverse_udata(&mut self, pool: &mut ObjectPool, id: UdataId) -> isize {
        let (mt, uservalues) = {
            let Some(b) = pool.udata.get(id.0) else { return 0 };
            (b.data.metatable, b.data.user_values.clone())
        };
        if let Some(mt) = mt {
            self.mark_object(pool, GcRef::Table(mt));
        }
        for v in &uservalues {
            self.mark_value(pool, v);
        }
        1 + uservalues.len() as isize
    }

    fn traverse_thread(&mut self, pool: &mut ObjectPool, id: ThreadId) -> isize {
        // The running thread may be aliased by the interpreter; read-only
        // access through a raw pointer keeps this traversal safe in the
        // single-threaded model.
        let Some(b) = pool.threads.get(id.0) else { return 0 };
        let st: *const crate::vm::LuaState = &b.data;
        let mut values: Vec<LuaValue> = Vec::new();
        let mut upvals: Vec<UpvalId> = Vec::new();
        unsafe {
            let st = &*st;
            values.extend_from_slice(&st.stack[..st.top]);
            for ci in &st.frames {
                values.push(st.stack[ci.func]);
            }
            values.push(st.error_value);
            values.extend_from_slice(&st.yield_values);
            for &(_, u) in &st.open_upvals {
                upvals.push(u);
            }
        }
        let n = values.len() as isize;
        for v in &values {
            self.mark_value(pool, v);
        }
        for u in upvals {
            self.mark_object(pool, GcRef::Upval(u));
        }
        1 + n
    }

    // ---- atomic ----

    fn atomic(&mut self, pool: &mut ObjectPool, roots: &[LuaValue]) -> isize {
        let mut work = 0isize;
        // Roots may have mutated since the cycle started.
        for v in roots {
            self.mark_value(pool, v);
        }
        let pending = self.tobefnz.clone();
        for r in pending {
            self.mark_object(pool, r);
        }
        while !self.gray.is_empty() {
            work += self.propagate_one(pool);
        }
        // Objects sent back to gray by write barriers.
        let again = std::mem::take(&mut self.grayagain);
        for r in again {
            work += self.traverse(pool, r);
        }
        while !self.gray.is_empty() {
            work += self.propagate_one(pool);
        }

        // Values behind marked open upvalues must survive even when their
        // owning thread is unreachable.
        work += self.remark_open_upvalues(pool);
        while !self.gray.is_empty() {
            work += self.propagate_one(pool);
        }

        // Ephemeron convergence: a value is live iff its key is.
        work += self.converge_ephemerons(pool);

        // Separate unreachable finalizable objects and resurrect them for
        // their finalizer run.
        work += self.separate_finalizable(pool);
        while !self.gray.is_empty() {
            work += self.propagate_one(pool);
        }
        // The resurrection may have revived ephemeron values.
        work += self.converge_ephemerons(pool);

        // Now clear what remained unreachable in weak structures.
        self.clear_weak_values(pool);
        self.clear_weak_keys(pool);

        self.current_white ^= 1;
        work
    }

    fn remark_open_upvalues(&mut self, pool: &mut ObjectPool) -> isize {
        let mut to_mark = Vec::new();
        for (_, b) in pool.upvals.iter() {
            if b.header.is_white() {
                continue;
            }
            if let Upvalue::Open { thread, slot } = &b.data {
                if let Some(tb) = pool.threads.get(thread.0) {
                    let st: *const crate::vm::LuaState = &tb.data;
                    let v = unsafe { (&(*st).stack).get(*slot).copied() };
                    if let Some(v) = v {
                        to_mark.push(v);
                    }
                }
            }
        }
        let n = to_mark.len() as isize;
        for v in &to_mark {
            self.mark_value(pool, v);
        }
        while !self.gray.is_empty() {
            self.propagate_one(pool);
        }
        n
    }

    fn converge_ephemerons(&mut self, pool: &mut ObjectPool) -> isize {
        let mut work = 0isize;
        loop {
            let mut changed = false;
            let tables = self.ephemerons.clone();
            for tid in tables {
                let mut to_mark = Vec::new();
                {
                    let Some(b) = pool.tables.get(tid.0) else { continue };
                    for (k, v) in b.data.entries_raw() {
                        if v.is_empty() {
                            continue;
                        }
                        let key_live = match GcRef::of_value(k) {
                            Some(r) => Self::is_marked(pool, r),
                            None => true,
                        };
                        if key_live {
                            if let Some(r) = GcRef::of_value(v) {
                                if !Self::is_marked(pool, r) {
                                    to_mark.push(*v);
                                }
                            }
                        }
                    }
                    // Also the array part: integer keys are always live.
                    for v in b.data.array_values() {
                        if let Some(r) = GcRef::of_value(v) {
                            if !Self::is_marked(pool, r) {
                                to_mark.push(*v);
                            }
                        }
                    }
                }
                if !to_mark.is_empty() {
                    changed = true;
                    work += to_mark.len() as isize;
                    for v in &to_mark {
                        self.mark_value(pool, v);
                    }
                    while !self.gray.is_empty() {
                        work += self.propagate_one(pool);
                    }
                }
            }
            if !changed {
                return work;
            }
        }
    }

    fn clear_weak_values(&mut self, pool: &mut ObjectPool) {
        let tables: Vec<TableId> =
            self.weak_values.iter().chain(self.all_weak.iter()).copied().collect();
        for tid in tables {
            self.clear_table(pool, tid, false, true);
        }
    }

    fn clear_weak_keys(&mut self, pool: &mut ObjectPool) {
        let tables: Vec<TableId> =
            self.ephemerons.iter().chain(self.all_weak.iter()).copied().collect();
        for tid in tables {
            self.clear_table(pool, tid, true, false);
        }
    }

    /// Clears entries whose weak key/value died. Dead hash keys become
    /// dead-key markers so an interrupted traversal stays coherent.
    fn clear_table(&mut self, pool: &mut ObjectPool, tid: TableId, by_key: bool, by_value: bool) {
        let mut dead_nodes = Vec::new();
        let mut dead_array = Vec::new();
        {
            let Some(b) = pool.tables.get(tid.0) else { return };
            let t = &b.data;
            for i in 0..t.node_count() {
                let (k, v) = t.node_at(i);
                if v.is_empty() {
                    continue;
                }
                let key_dead = by_key
                    && GcRef::of_value(k).map(|r| !Self::is_marked_for_clear(pool, r)).unwrap_or(false);
                let val_dead = by_value
                    && GcRef::of_value(v).map(|r| !Self::is_marked_for_clear(pool, r)).unwrap_or(false);
                if key_dead || val_dead {
                    dead_nodes.push(i);
                }
            }
            if by_value {
                for (i, v) in t.array_values_indexed() {
                    if GcRef::of_value(v).map(|r| !Self::is_marked_for_clear(pool, r)).unwrap_or(false)
                    {
                        dead_array.push(i);
                    }
                }
            }
        }
        let b = pool.tables.get_mut(tid.0).expect("weak table vanished");
        for i in dead_nodes {
            b.data.kill_entry(i);
        }
        for i in dead_array {
            b.data.clear_array_slot(i);
        }
    }

    fn is_marked_for_clear(pool: &ObjectPool, r: GcRef) -> bool {
        Self::header(pool, r).map(|h| !h.is_white()).unwrap_or(false)
    }

    // ---- finalizers ----

    /// Registers an object for finalization (it has `__gc` now). Called
    /// by the VM when a metatable with `__gc` is attached.
    pub fn mark_finalizable(&mut self, pool: &mut ObjectPool, r: GcRef) {
        if let Some(h) = Self::header_mut(pool, r) {
            if !h.is_finalized() {
                h.set_finalized();
                self.finobj.push(r);
            }
        }
    }

    fn separate_finalizable(&mut self, pool: &mut ObjectPool) -> isize {
        let mut work = 0isize;
        let mut still_alive = Vec::with_capacity(self.finobj.len());
        let finobj = std::mem::take(&mut self.finobj);
        for r in finobj {
            let dead = Self::header(pool, r).map(|h| h.is_white()).unwrap_or(true);
            if dead && Self::header(pool, r).is_some() {
                // Resurrect for exactly one finalizer run.
                self.mark_object(pool, r);
                self.tobefnz.push(r);
                work += 1;
            } else if Self::header(pool, r).is_some() {
                still_alive.push(r);
            }
        }
        self.finobj = still_alive;
        work
    }

    /// Pops the next object awaiting finalization. The VM calls its
    /// `__gc` from the main thread and reports errors to the warning
    /// channel.
    pub fn take_finalizable(&mut self) -> Option<GcRef> {
        self.tobefnz.pop()
    }

    // ---- sweep ----

    /// Sweeps up to `quantum` slots; true when the whole heap was swept.
    fn sweep_quantum(&mut self, pool: &mut ObjectPool, quantum: usize) -> bool {
        let minor = self.kind == GcKind::Generational && self.is_minor_cycle();
        let mut budget = quantum;
        let other_white = self.current_white ^ 1;
        while budget > 0 {
            let bound = match self.sweep_pool {
                0 => pool.strings.pool.slot_bound(),
                1 => pool.tables.slot_bound(),
                2 => pool.closures.slot_bound(),
                3 => pool.upvals.slot_bound(),
                4 => pool.udata.slot_bound(),
                5 => pool.threads.slot_bound(),
                _ => return true,
            };
            if self.sweep_slot >= bound {
                self.sweep_pool += 1;
                self.sweep_slot = 0;
                continue;
            }
            let slot = self.sweep_slot as u32;
            self.sweep_slot += 1;
            budget -= 1;
            self.sweep_slot_at(pool, self.sweep_pool, slot, other_white, minor);
        }
        false
    }

    fn is_minor_cycle(&self) -> bool {
        // In generational mode, minor cycles are the common case; a major
        // cycle is forced every MINOR_PER_MAJOR collections.
        self.minor_count % MINOR_PER_MAJOR != 0
    }

    fn sweep_slot_at(
        &mut self,
        pool: &mut ObjectPool,
        pool_idx: usize,
        slot: u32,
        other_white: u8,
        minor: bool,
    ) {
        #[derive(PartialEq)]
        enum Action {
            Skip,
            Free,
            Age,
        }
        let header: Option<GcHeader> = match pool_idx {
            0 => pool.strings.pool.get(slot).map(|b| b.header),
            1 => pool.tables.get(slot).map(|b| b.header),
            2 => pool.closures.get(slot).map(|b| b.header),
            3 => pool.upvals.get(slot).map(|b| b.header),
            4 => pool.udata.get(slot).map(|b| b.header),
            5 => pool.threads.get(slot).map(|b| b.header),
            _ => None,
        };
        let action = match header {
            None => Action::Skip,
            Some(h) => {
                if h.is_fixed() {
                    Action::Skip
                } else if h.is_dead(other_white) && !(minor && h.is_old()) {
                    Action::Free
                } else {
                    Action::Age
                }
            }
        };
        match action {
            Action::Skip => {}
            Action::Free => {
                let size = match pool_idx {
                    0 => pool.strings.remove(StringId(slot)),
                    1 => pool.tables.free(slot),
                    2 => pool.closures.free(slot),
                    3 => pool.upvals.free(slot),
                    4 => pool.udata.free(slot),
                    5 => pool.threads.free(slot),
                    _ => 0,
                };
                self.account_free(size);
            }
            Action::Age => {
                let h = match pool_idx {
                    0 => pool.strings.pool.get_mut(slot).map(|b| &mut b.header),
                    1 => pool.tables.get_mut(slot).map(|b| &mut b.header),
                    2 => pool.closures.get_mut(slot).map(|b| &mut b.header),
                    3 => pool.upvals.get_mut(slot).map(|b| &mut b.header),
                    4 => pool.udata.get_mut(slot).map(|b| &mut b.header),
                    5 => pool.threads.get_mut(slot).map(|b| &mut b.header),
                    _ => None,
                };
                if let Some(h) = h {
                    match h.age() {
                        header::G_NEW => h.set_age(header::G_SURVIVAL),
                        header::G_SURVIVAL => h.set_age(header::G_OLD),
                        _ => {}
                    }
                }
            }
        }
    }

    // ---- generational minor collection ----

    /// A minor collection: full mark from roots (correct by construction)
    /// with sweeping restricted to young objects. Old objects are only
    /// reclaimed by the periodic major cycle.
    fn minor_collection(&mut self, pool: &mut ObjectPool, roots: &[LuaValue]) -> GcSignal {
        self.minor_count = self.minor_count.wrapping_add(1);
        if !self.is_minor_cycle() {
            return self.full_collection_inner(pool, roots);
        }
        self.stats.minor_collections += 1;
        self.restart_cycle(pool, roots);
        while !self.gray.is_empty() {
            self.propagate_one(pool);
        }
        self.atomic(pool, roots);
        self.sweep_pool = 0;
        self.sweep_slot = 0;
        while !self.sweep_quantum(pool, usize::MAX) {}
        self.state = GcState::Pause;
        if self.tobefnz.is_empty() { GcSignal::None } else { GcSignal::RunFinalizers }
    }

    fn full_collection_inner(&mut self, pool: &mut ObjectPool, roots: &[LuaValue]) -> GcSignal {
        let mut signal = GcSignal::None;
        loop {
            self.single_step(pool, roots, true);
            if !self.tobefnz.is_empty() {
                signal = GcSignal::RunFinalizers;
            }
            if self.state == GcState::Pause {
                break;
            }
        }
        self.set_pause_debt();
        signal
    }

    // ---- write barriers ----

    /// True while the invariant "no black points to white" must hold.
    #[inline]
    fn keep_invariant(&self) -> bool {
        matches!(self.state, GcState::Propagate | GcState::Atomic)
    }

    /// Backward barrier for tables: a black table acquired a new (maybe
    /// white) entry, so it goes back to gray for re-traversal. Tables use
    /// the backward form because they tend to be mutated repeatedly.
    pub fn barrier_back(&mut self, pool: &mut ObjectPool, t: TableId) {
        let Some(b) = pool.tables.get_mut(t.0) else { return };
        if !b.header.is_black() {
            return;
        }
        b.header.make_gray();
        if !self.grayagain.contains(&GcRef::Table(t)) {
            self.grayagain.push(GcRef::Table(t));
        }
    }

    /// Forward barrier: a black owner just stored a white value; mark the
    /// value immediately to restore the invariant. Used for upvalues,
    /// userdata, and metatable edges.
    pub fn barrier_forward(&mut self, pool: &mut ObjectPool, owner: GcRef, v: &LuaValue) {
        if !self.keep_invariant() {
            return;
        }
        let owner_black = Self::header(pool, owner).map(|h| h.is_black()).unwrap_or(false);
        if !owner_black {
            return;
        }
        self.mark_value(pool, v);
    }

    /// Barrier for an upvalue that just closed over a value.
    pub fn barrier_upval_close(&mut self, pool: &mut ObjectPool, id: UpvalId, v: &LuaValue) {
        self.barrier_forward(pool, GcRef::Upval(id), v);
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

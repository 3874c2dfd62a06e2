// String storage. Short strings are interned per-arena: creating the same
// short byte sequence twice yields the same object, so identity equality
// is content equality. Long strings live unshared with a lazily computed
// hash. The intern map holds its entries weakly in spirit: the sweep phase
// removes dead strings from it atomically with their death.

use crate::gc::header::GcHeader;
use crate::gc::pool::{Pool, StringId};
use crate::limits::MAX_SHORT_LEN;
use ahash::RandomState;
use std::cell::Cell;
use std::collections::HashMap;
use std::hash::BuildHasher;

pub struct LuaStr {
    bytes: Box<[u8]>,
    /// Cached content hash; 0 means "not yet computed" (long strings).
    hash: Cell<u64>,
    pub is_short: bool,
}

impl LuaStr {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Lossy view for diagnostics; Lua strings are byte sequences.
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

pub struct StringArena {
    pub(crate) pool: Pool<LuaStr>,
    /// Interned short strings, keyed by content.
    map: HashMap<Box<[u8]>, StringId, RandomState>,
    hasher: RandomState,
}

impl StringArena {
    pub fn new() -> Self {
        StringArena {
            pool: Pool::new(),
            map: HashMap::with_hasher(RandomState::new()),
            hasher: RandomState::new(),
        }
    }

    /// Creates or revives a string. Returns (id, is_short, newly_created,
    /// approximate size); the caller is responsible for GC accounting when
    /// a new object was made.
    pub fn create(&mut self, bytes: &[u8], current_white: u8) -> (StringId, bool, bool, usize) {
        let size = std::mem::size_of::<LuaStr>() + bytes.len();
        if bytes.len() <= MAX_SHORT_LEN {
            if let Some(&id) = self.map.get(bytes) {
                // Revive a string scheduled for sweep: re-interning makes
                // it reachable again.
                if let Some(b) = self.pool.get_mut(id.0) {
                    if b.header.is_white() {
                        b.header.make_white(current_white);
                    }
                }
                return (id, true, false, size);
            }
            let h = self.hasher.hash_one(bytes);
            let s = LuaStr { bytes: bytes.into(), hash: Cell::new(h | 1), is_short: true };
            let id = StringId(self.pool.alloc(s, GcHeader::new(current_white, size as u32)));
            self.map.insert(bytes.into(), id);
            (id, true, true, size)
        } else {
            let s = LuaStr { bytes: bytes.into(), hash: Cell::new(0), is_short: false };
            let id = StringId(self.pool.alloc(s, GcHeader::new(current_white, size as u32)));
            (id, false, true, size)
        }
    }

    #[inline]
    pub fn get(&self, id: StringId) -> &LuaStr {
        &self.pool.get(id.0).expect("dangling string id").data
    }

    #[inline]
    pub fn bytes(&self, id: StringId) -> &[u8] {
        self.get(id).as_bytes()
    }

    /// Content hash, cached on first use. The low bit is forced so 0 can
    /// serve as the "unset" sentinel.
    pub fn hash_of(&self, id: StringId) -> u64 {
        let s = self.get(id);
        let h = s.hash.get();
        if h != 0 {
            return h;
        }
        let h = self.hasher.hash_one(s.as_bytes()) | 1;
        s.hash.set(h);
        h
    }

    /// Content equality; for short strings id equality is definitive.
    pub fn str_eq(&self, a: StringId, b: StringId) -> bool {
        a == b || {
            let (sa, sb) = (self.get(a), self.get(b));
            !sa.is_short && !sb.is_short && sa.bytes == sb.bytes
        }
    }

    /// Drops a dead string, unregistering short ones from the intern map
    /// in the same step (no window where the map could hand out a corpse).
    pub fn remove(&mut self, id: StringId) -> usize {
        if let Some(boxed) = self.pool.get(id.0) {
            if boxed.data.is_short {
                self.map.remove(boxed.data.as_bytes() as &[u8]);
            }
        }
        self.pool.free(id.0)
    }

    pub fn live_count(&self) -> usize {
        self.pool.len()
    }
}

impl Default for StringArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_interned() {
        let mut sa = StringArena::new();
        let (a, short_a, new_a, _) = sa.create(b"foo", 0);
        let (b, short_b, new_b, _) = sa.create(b"foo", 0);
        assert!(short_a && short_b);
        assert!(new_a && !new_b);
        assert_eq!(a, b);
    }

    #[test]
    fn long_strings_not_interned() {
        let mut sa = StringArena::new();
        let long = vec![b'x'; 100];
        let (a, short_a, _, _) = sa.create(&long, 0);
        let (b, _, new_b, _) = sa.create(&long, 0);
        assert!(!short_a);
        assert!(new_b);
        assert_ne!(a, b);
        assert!(sa.str_eq(a, b));
        assert_eq!(sa.hash_of(a), sa.hash_of(b));
    }

    #[test]
    fn removal_unregisters_intern_entry() {
        let mut sa = StringArena::new();
        let (a, _, _, _) = sa.create(b"gone", 0);
        sa.remove(a);
        let (b, _, new_b, _) = sa.create(b"gone", 0);
        assert!(new_b);
        assert_ne!(a.0, u32::MAX);
        let _ = b;
    }
}

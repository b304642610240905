//! The linear entity arena and its mark-compact collector.
//!
//! All heap-resident values — objects, properties, and strings — live packed
//! back-to-back in a single caller-supplied byte buffer. `brk` is the
//! boundary between live entities (`[0, brk)`) and free space; allocation is
//! a bump of `brk`. There is no free list and no per-entity header beyond a
//! single offset word, so the whole arena can be walked by repeatedly adding
//! `esize(word)` to an offset starting at zero.
//!
//! Pinned native-callback descriptors are the one exception: they're
//! allocated from the *top* of the buffer downward (shrinking `size`, not
//! growing `brk`) so a native caller can hold a raw index into them across
//! any number of collections without the GC ever relocating or freeing them.
//!
//! Collection is mark-compact and runs only between top-level statements
//! (see [`crate::parser`]), never mid-expression: every live entity is first
//! marked for deletion, then everything reachable from a scope chain,
//! property value, or pinned descriptor is unmarked, then every
//! still-marked entity is spliced out and every offset in the arena past the
//! removed bytes is shifted down to match.

use crate::error::{EngineError, Result};
use crate::value::{Offset, Type, Value, Word};

/// High bit of an entity's leading offset word. Set while an entity is
/// condemned by the mark phase; cleared the moment something reachable
/// points back to it.
const MARK: u32 = 1 << 31;

const KIND_MASK: u32 = 0x3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityKind {
    Object,
    Property,
    Str,
}

impl EntityKind {
    fn from_bits(bits: u32) -> Self {
        match bits & KIND_MASK {
            0 => Self::Object,
            1 => Self::Property,
            _ => Self::Str,
        }
    }

    fn bits(self) -> u32 {
        match self {
            Self::Object => 0,
            Self::Property => 1,
            Self::Str => 2,
        }
    }
}

fn align4(v: u32) -> u32 {
    (v + 3) & !3
}

/// Entity byte size derived purely from its leading word, mirroring the
/// property that an unmarked arena can be walked without any side table.
fn entity_size(leading_word: u32) -> u32 {
    match EntityKind::from_bits(leading_word) {
        EntityKind::Object => 8,
        EntityKind::Property => 8 + std::mem::size_of::<Word>() as u32,
        EntityKind::Str => 4 + align4(leading_word >> 2),
    }
}

fn is_heap_type(t: Type) -> bool {
    matches!(t, Type::Object | Type::Property | Type::Str | Type::Function)
}

/// A fixed-capacity byte buffer hosting every live script entity plus, at
/// its tail, the pinned native-callback descriptors.
pub struct Arena {
    mem: Box<[u8]>,
    /// End of live-entity space; grows on allocation, shrinks on GC.
    brk: Offset,
    /// Start of the pinned-descriptor region; shrinks as descriptors pin.
    pinned_start: Offset,
    size: Offset,
}

/// A pinned, never-relocated-in-place (but offset-tracked) record letting
/// native code retain a script function handle across collections. See
/// [`crate::native`] for the side that hands these out.
#[derive(Clone, Copy)]
pub(crate) struct PinnedCallback {
    pub(crate) func: Offset,
    pub(crate) userdata: Offset,
}

const PINNED_SIZE: u32 = 2 * 4;

impl Arena {
    pub(crate) fn new(capacity: usize) -> Result<Self> {
        let size = u32::try_from(capacity).map_err(|_| EngineError::OutOfMemory)?;
        if size < 16 {
            return Err(EngineError::OutOfMemory);
        }
        Ok(Self {
            mem: vec![0u8; capacity].into_boxed_slice(),
            brk: 0,
            pinned_start: size,
            size,
        })
    }

    pub(crate) fn brk(&self) -> Offset {
        self.brk
    }

    pub(crate) fn set_brk(&mut self, brk: Offset) {
        self.brk = brk;
    }

    pub(crate) fn size(&self) -> Offset {
        self.size
    }

    /// Percentage of the live-entity region currently in use, rounded down.
    pub(crate) fn usage_percent(&self) -> u32 {
        if self.size == 0 {
            return 0;
        }
        (u64::from(self.brk) * 100 / u64::from(self.size)) as u32
    }

    fn load_u32(&self, off: Offset) -> u32 {
        let off = off as usize;
        u32::from_ne_bytes(self.mem[off..off + 4].try_into().unwrap())
    }

    fn save_u32(&mut self, off: Offset, v: u32) {
        let off = off as usize;
        self.mem[off..off + 4].copy_from_slice(&v.to_ne_bytes());
    }

    fn load_value(&self, off: Offset) -> Value {
        let off = off as usize;
        let width = std::mem::size_of::<Word>();
        let bytes = &self.mem[off..off + width];
        #[cfg(not(feature = "word32"))]
        let raw = u64::from_ne_bytes(bytes.try_into().unwrap());
        #[cfg(feature = "word32")]
        let raw = u32::from_ne_bytes(bytes.try_into().unwrap());
        Value::from_raw(raw)
    }

    fn save_value(&mut self, off: Offset, v: Value) {
        let off = off as usize;
        let width = std::mem::size_of::<Word>();
        self.mem[off..off + width].copy_from_slice(&v.raw().to_ne_bytes());
    }

    pub(crate) fn bytes_at(&self, off: Offset, len: u32) -> &[u8] {
        let off = off as usize;
        &self.mem[off..off + len as usize]
    }

    fn alloc(&mut self, len: u32) -> Result<Offset> {
        let aligned = align4(len);
        let off = self.brk;
        if off.checked_add(aligned).is_none_or(|end| end > self.pinned_start) {
            return Err(EngineError::OutOfMemory);
        }
        self.brk += aligned;
        Ok(off)
    }

    fn mkentity(&mut self, leading: u32, payload: &[u8]) -> Result<Offset> {
        let off = self.alloc(4 + payload.len() as u32)?;
        self.save_u32(off, leading);
        let data_off = off as usize + 4;
        self.mem[data_off..data_off + payload.len()].copy_from_slice(payload);
        if EntityKind::from_bits(leading) == EntityKind::Str {
            self.mem[data_off + payload.len()] = 0;
        }
        Ok(off)
    }

    /// Allocates an empty object whose upper-scope pointer is `parent`.
    pub(crate) fn mk_object(&mut self, parent: Offset) -> Result<Value> {
        let leading = EntityKind::Object.bits();
        let off = self.mkentity(leading, &parent.to_ne_bytes())?;
        Ok(Value::offset_entity(Type::Object, off))
    }

    /// Allocates a 0-terminated, length-prefixed string entity.
    pub(crate) fn mk_string(&mut self, bytes: &[u8]) -> Result<Value> {
        let leading = (((bytes.len() as u32 + 1) << 2) & !KIND_MASK) | EntityKind::Str.bits();
        let off = self.mkentity(leading, bytes)?;
        Ok(Value::offset_entity(Type::Str, off))
    }

    pub(crate) fn string_bytes(&self, v: Value) -> &[u8] {
        let off = v.offset();
        let leading = self.load_u32(off);
        let len = (leading >> 2) - 1;
        self.bytes_at(off + 4, len)
    }

    /// Prepends a new property to `obj`'s property list, returning the
    /// freshly created property entity's offset.
    pub(crate) fn set_prop(&mut self, obj: Value, key: Value, val: Value) -> Result<Offset> {
        let head = obj.offset();
        let first = self.load_u32(head);
        let word_width = std::mem::size_of::<Word>();
        let mut payload = vec![0u8; 4 + word_width];
        payload[0..4].copy_from_slice(&key.offset().to_ne_bytes());
        payload[4..4 + word_width].copy_from_slice(&val.raw().to_ne_bytes());
        let new_prop_ptr = self.brk | EntityKind::Object.bits();
        self.save_u32(head, new_prop_ptr);
        let leading = (first & !KIND_MASK) | EntityKind::Property.bits();
        self.mkentity(leading, &payload)
    }

    /// Walks `obj`'s property list looking for `key` (already-interned
    /// string bytes), returning the matching property's value if found.
    pub(crate) fn lookup_own(&self, obj: Value, key: &[u8]) -> Option<Value> {
        let mut next = self.load_u32(obj.offset()) & !KIND_MASK;
        while next != 0 && next < self.brk {
            let koff = self.load_u32(next + 4);
            let kleading = self.load_u32(koff);
            let klen = (kleading >> 2) - 1;
            if self.bytes_at(koff + 4, klen) == key {
                let val = self.load_value(next + 8);
                return Some(val);
            }
            next = self.load_u32(next) & !KIND_MASK;
        }
        None
    }

    /// Like [`Self::lookup_own`] but returns the property entity's own
    /// offset rather than its stored value, so the caller can hold onto it
    /// as an addressable `Property` value (an lvalue) instead of a resolved
    /// read.
    pub(crate) fn lookup_own_property(&self, obj: Value, key: &[u8]) -> Option<Offset> {
        let mut next = self.load_u32(obj.offset()) & !KIND_MASK;
        while next != 0 && next < self.brk {
            let koff = self.load_u32(next + 4);
            let kleading = self.load_u32(koff);
            let klen = (kleading >> 2) - 1;
            if self.bytes_at(koff + 4, klen) == key {
                return Some(next);
            }
            next = self.load_u32(next) & !KIND_MASK;
        }
        None
    }

    /// Overwrites an existing own property's value in place; returns `false`
    /// if `key` isn't already an own property of `obj`.
    pub(crate) fn set_own(&mut self, obj: Value, key: &[u8], val: Value) -> bool {
        let mut next = self.load_u32(obj.offset()) & !KIND_MASK;
        while next != 0 && next < self.brk {
            let koff = self.load_u32(next + 4);
            let kleading = self.load_u32(koff);
            let klen = (kleading >> 2) - 1;
            if self.bytes_at(koff + 4, klen) == key {
                self.save_value(next + 8, val);
                return true;
            }
            next = self.load_u32(next) & !KIND_MASK;
        }
        false
    }

    /// Iterates an object's own properties in the arena's natural traversal
    /// order: newest-first, since [`Self::set_prop`] always prepends.
    pub(crate) fn properties(&self, obj: Value) -> PropertiesIter<'_> {
        PropertiesIter {
            arena: self,
            next: self.load_u32(obj.offset()) & !KIND_MASK,
        }
    }

    pub(crate) fn parent_scope(&self, obj: Value) -> Value {
        let off = self.load_u32(obj.offset() + 4);
        Value::offset_entity(Type::Object, off)
    }

    /// Reads a Property entity's stored value word.
    pub(crate) fn prop_value(&self, prop: Value) -> Value {
        self.load_value(prop.offset() + 8)
    }

    /// Overwrites a Property entity's value word in place — the mechanism
    /// behind plain and compound assignment.
    pub(crate) fn set_prop_value(&mut self, prop: Value, val: Value) {
        self.save_value(prop.offset() + 8, val);
    }

    // --- pinned native-callback descriptors -------------------------------

    pub(crate) fn pin_callback(&mut self, func: Offset, userdata: Offset) -> Result<u32> {
        let new_start = self
            .pinned_start
            .checked_sub(PINNED_SIZE)
            .filter(|&s| s >= self.brk)
            .ok_or(EngineError::OutOfMemory)?;
        self.pinned_start = new_start;
        self.save_u32(new_start, func);
        self.save_u32(new_start + 4, userdata);
        Ok((self.size - PINNED_SIZE - new_start) / PINNED_SIZE)
    }

    pub(crate) fn pinned_count(&self) -> u32 {
        (self.size - self.pinned_start) / PINNED_SIZE
    }

    fn pinned_at(&self, index: u32) -> PinnedCallback {
        let base = self.size - (index + 1) * PINNED_SIZE;
        PinnedCallback {
            func: self.load_u32(base),
            userdata: self.load_u32(base + 4),
        }
    }

    fn set_pinned_at(&mut self, index: u32, cb: PinnedCallback) {
        let base = self.size - (index + 1) * PINNED_SIZE;
        self.save_u32(base, cb.func);
        self.save_u32(base + 4, cb.userdata);
    }

    pub(crate) fn pinned(&self, index: u32) -> PinnedCallback {
        self.pinned_at(index)
    }

    // --- garbage collection -------------------------------------------------

    /// Runs a full mark-compact collection rooted at `scope` (the active
    /// scope chain) plus every pinned callback descriptor. Called only at
    /// top-level statement boundaries.
    pub(crate) fn collect(&mut self, scope: Value) -> Value {
        self.mark_all_for_deletion();
        self.unmark_reachable(scope);
        self.delete_marked(scope)
    }

    fn mark_all_for_deletion(&mut self) {
        let mut off = 0;
        while off < self.brk {
            let v = self.load_u32(off);
            let n = entity_size(v);
            self.save_u32(off, v | MARK);
            off += n;
        }
    }

    fn unmark_entity(&mut self, off: Offset) -> Offset {
        if off == 0 {
            return 0;
        }
        let v = self.load_u32(off);
        if v & MARK == 0 {
            return v & !KIND_MASK;
        }
        self.save_u32(off, v & !MARK);
        match EntityKind::from_bits(v) {
            EntityKind::Object => {
                self.unmark_entity(v & !(MARK | KIND_MASK));
            }
            EntityKind::Property => {
                self.unmark_entity(v & !(MARK | KIND_MASK));
                let koff = self.load_u32(off + 4);
                self.unmark_entity(koff);
                let val = self.load_value(off + 8);
                if is_heap_type(val.value_type()) {
                    self.unmark_entity(val.offset());
                }
            }
            EntityKind::Str => {}
        }
        v & !(MARK | KIND_MASK)
    }

    fn unmark_reachable(&mut self, scope: Value) {
        let mut scope = scope;
        loop {
            self.unmark_entity(scope.offset());
            let mut off = self.load_u32(scope.offset()) & !KIND_MASK;
            while off != 0 && off < self.brk {
                off = self.unmark_entity(off);
            }
            if scope.offset() == 0 {
                break;
            }
            scope = self.parent_scope(scope);
        }
        for i in 0..self.pinned_count() {
            let cb = self.pinned_at(i);
            self.unmark_entity(cb.func);
            self.unmark_entity(cb.userdata);
        }
    }

    /// Rewrites every surviving offset greater than `start` down by `shrink`
    /// bytes: object/property links, property keys and values, pinned
    /// descriptor offsets, and the caller-visible `scope` itself.
    fn fixup_offsets(&mut self, start: Offset, shrink: Offset, scope: Value) -> Value {
        let mut off = 0;
        while off < self.brk {
            let v = self.load_u32(off);
            let n = entity_size(v & !MARK);
            if v & MARK == 0 {
                let kind = EntityKind::from_bits(v);
                if kind == EntityKind::Object || kind == EntityKind::Property {
                    if v > start {
                        self.save_u32(off, v - shrink);
                    }
                    if kind == EntityKind::Object {
                        let parent = self.load_u32(off + 4);
                        if parent > start {
                            self.save_u32(off + 4, parent - shrink);
                        }
                    } else {
                        let koff = self.load_u32(off + 4);
                        if koff > start {
                            self.save_u32(off + 4, koff - shrink);
                        }
                        let val = self.load_value(off + 8);
                        if is_heap_type(val.value_type()) && val.offset() > start {
                            let new_val = Value::offset_entity(val.value_type(), val.offset() - shrink);
                            self.save_value(off + 8, new_val);
                        }
                    }
                }
            }
            off += n;
        }
        for i in 0..self.pinned_count() {
            let cb = self.pinned_at(i);
            let func = if cb.func > start { cb.func - shrink } else { cb.func };
            let userdata = if cb.userdata > start { cb.userdata - shrink } else { cb.userdata };
            self.set_pinned_at(i, PinnedCallback { func, userdata });
        }
        if scope.offset() > start {
            Value::offset_entity(Type::Object, scope.offset() - shrink)
        } else {
            scope
        }
    }

    fn delete_marked(&mut self, scope: Value) -> Value {
        let mut scope = scope;
        let mut off = 0;
        while off < self.brk {
            let v = self.load_u32(off);
            let mut n = entity_size(v & !MARK);
            if v & MARK != 0 {
                scope = self.fixup_offsets(off, n, scope);
                let tail_start = (off + n) as usize;
                let tail_len = (self.brk - off - n) as usize;
                self.mem.copy_within(tail_start..tail_start + tail_len, off as usize);
                self.brk -= n;
                n = 0;
            }
            off += n;
        }
        scope
    }
}

/// Iterator over an object's own properties, yielding `(key bytes, value)`
/// pairs newest-first. See [`Arena::properties`].
pub(crate) struct PropertiesIter<'a> {
    arena: &'a Arena,
    next: Offset,
}

impl<'a> Iterator for PropertiesIter<'a> {
    type Item = (&'a [u8], Value);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 0 || self.next >= self.arena.brk {
            return None;
        }
        let off = self.next;
        let koff = self.arena.load_u32(off + 4);
        let kleading = self.arena.load_u32(koff);
        let klen = (kleading >> 2) - 1;
        let key = self.arena.bytes_at(koff + 4, klen);
        let val = self.arena.load_value(off + 8);
        self.next = self.arena.load_u32(off) & !KIND_MASK;
        Some((key, val))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scope's parent link must survive compaction even when the parent
    /// object itself is relocated, not just when the scope's own leading
    /// offset moves.
    #[test]
    fn collect_rewrites_object_parent_offset_after_compaction() {
        let mut arena = Arena::new(4096).unwrap();
        let global = arena.mk_object(0).unwrap();
        let garbage = arena.mk_string(b"unreachable junk").unwrap();
        let garbage_size = entity_size(arena.load_u32(garbage.offset()));
        let mid = arena.mk_object(global.offset()).unwrap();
        let mid_offset_before = mid.offset();
        let child = arena.mk_object(mid.offset()).unwrap();

        let new_child = arena.collect(child);

        let new_mid = arena.parent_scope(new_child);
        assert_eq!(new_mid.offset(), mid_offset_before - garbage_size);
        assert_eq!(arena.parent_scope(new_mid).offset(), global.offset());
    }
}

//! The engine-owned value arena and the temp value pool.
//!
//! All runtime values live in [`Heap`] slots addressed by [`ValueId`].
//! Members of user values and elements of collections hold ids rather than
//! inline values, so pushing "member 2 of this" onto the call stack is just
//! copying a handle — writes through the handle are visible everywhere the
//! value is shared. This removes every lifetime cycle between classes,
//! bodies, and values.
//!
//! The temp pool caches reusable values keyed by (class id, const flag) to
//! avoid allocation for short-lived expression results. A borrow sets the
//! value's in-use flag; the interpreter clears it when the stack slot pops,
//! on both the normal and the unwind path.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    class::ClassKind,
    error::NativeError,
    registry::ClassRegistry,
    types::{ClassId, DbgFmt, Intrinsic},
    value::{Value, ValueData},
};

/// Handle to a value slot in the engine heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(u32);

impl ValueId {
    #[cfg(test)]
    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Arena of runtime values with slot reuse.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Value>>,
    free: Vec<u32>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live values, for leak checks in tests.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Allocates a slot for a value.
    pub fn alloc(&mut self, value: Value) -> ValueId {
        if let Some(ix) = self.free.pop() {
            self.slots[ix as usize] = Some(value);
            ValueId(ix)
        } else {
            self.slots.push(Some(value));
            ValueId((self.slots.len() - 1) as u32)
        }
    }

    /// Frees a value and, recursively, the member/element values it owns.
    pub fn free(&mut self, id: ValueId) {
        let Some(value) = self.slots.get_mut(id.index()).and_then(Option::take) else {
            debug_assert!(false, "double free of value slot {id:?}");
            return;
        };
        if let Some(children) = value.data.child_ids() {
            for child in children.to_vec() {
                self.free(child);
            }
        }
        self.free.push(id.0);
    }

    /// Shared access to a value. A stale handle is an engine bug.
    #[must_use]
    pub fn get(&self, id: ValueId) -> &Value {
        self.slots[id.index()].as_ref().expect("stale value handle")
    }

    pub fn get_mut(&mut self, id: ValueId) -> &mut Value {
        self.slots[id.index()].as_mut().expect("stale value handle")
    }

    /// Builds default-initialized storage for an instance of a class.
    ///
    /// Walks the class's full member list (inherited first) and builds each
    /// member recursively — no macro code runs; constructors are explicit
    /// methods the caller invokes afterwards. Declared literal initializers
    /// for primitive members are applied here.
    pub fn make_storage(
        &mut self,
        registry: &ClassRegistry,
        class_id: ClassId,
        is_const: bool,
    ) -> Result<ValueId, NativeError> {
        let class = registry.class_by_id(class_id)?;
        let data = match class.kind() {
            ClassKind::Enum(_) => ValueData::Enum(0),
            ClassKind::Array { elem, size } => {
                let (elem, size) = (*elem, *size);
                let mut elems = Vec::with_capacity(size as usize);
                for _ in 0..size {
                    elems.push(self.make_storage(registry, elem, false)?);
                }
                ValueData::Collection(elems)
            }
            ClassKind::Vector { .. } => ValueData::Collection(Vec::new()),
            ClassKind::Normal => {
                if let Some(intrinsic) = Intrinsic::from_id(class_id) {
                    ValueData::scalar_default(intrinsic)
                } else {
                    let members: Vec<_> = class.members().to_vec();
                    let mut ids = Vec::with_capacity(members.len());
                    for member in &members {
                        let id = self.make_storage(registry, member.class_id, member.is_const)?;
                        if let Some(init) = &member.init {
                            self.get_mut(id).data = init.clone();
                        }
                        ids.push(id);
                    }
                    ValueData::User(ids)
                }
            }
        };
        Ok(self.alloc(Value::new(class_id, is_const, data)))
    }

    /// Copies `src` into `dst`.
    ///
    /// Fails unless both values have exactly the same class and that class
    /// is copyable. User values copy member-wise; vectors restructure the
    /// target to match the source element count.
    pub fn copy_value(&mut self, registry: &ClassRegistry, dst: ValueId, src: ValueId) -> Result<(), NativeError> {
        let dst_class = self.get(dst).class_id();
        let src_class = self.get(src).class_id();
        if dst_class != src_class || !registry.is_copyable(dst_class) {
            return Err(NativeError::NotCopyable {
                target: dst_class,
                source: src_class,
            });
        }
        self.copy_unchecked(registry, dst, src)
    }

    fn copy_unchecked(&mut self, registry: &ClassRegistry, dst: ValueId, src: ValueId) -> Result<(), NativeError> {
        match self.get(src).data.clone() {
            ValueData::User(src_members) => {
                let dst_members = match &self.get(dst).data {
                    ValueData::User(ids) => ids.clone(),
                    _ => return Err(NativeError::BadStackItem("user value")),
                };
                for (d, s) in dst_members.into_iter().zip(src_members) {
                    self.copy_unchecked(registry, d, s)?;
                }
            }
            ValueData::Collection(src_elems) => {
                let class_id = self.get(dst).class_id();
                let elem_class = registry
                    .class_by_id(class_id)?
                    .elem_class()
                    .ok_or(NativeError::BadStackItem("collection value"))?;
                let mut dst_elems = match &self.get(dst).data {
                    ValueData::Collection(ids) => ids.clone(),
                    _ => return Err(NativeError::BadStackItem("collection value")),
                };
                while dst_elems.len() > src_elems.len() {
                    let extra = dst_elems.pop().expect("non-empty element list");
                    self.free(extra);
                }
                while dst_elems.len() < src_elems.len() {
                    dst_elems.push(self.make_storage(registry, elem_class, false)?);
                }
                for (d, s) in dst_elems.iter().zip(&src_elems) {
                    self.copy_unchecked(registry, *d, *s)?;
                }
                self.get_mut(dst).data = ValueData::Collection(dst_elems);
            }
            scalar => self.get_mut(dst).data = scalar,
        }
        Ok(())
    }

    /// Formats a value for debugger display. Long format expands one level
    /// of user-class members; short format names the class instead.
    pub fn dbg_format(&self, registry: &ClassRegistry, id: ValueId, fmt: DbgFmt, radix: u32, out: &mut String) -> bool {
        use std::fmt::Write;
        let value = self.get(id);
        if value.data.dbg_format(out, radix) {
            return true;
        }
        let Ok(class) = registry.class_by_id(value.class_id()) else {
            return false;
        };
        match (&value.data, fmt) {
            (ValueData::User(_) | ValueData::Collection(_), DbgFmt::Short) => {
                let _ = write!(out, "<{}>", class.class_path());
                true
            }
            (ValueData::User(members), DbgFmt::Long) => {
                out.push('{');
                for (member, &member_id) in class.members().iter().zip(members) {
                    let _ = write!(out, " {}=", member.name);
                    self.dbg_format(registry, member_id, DbgFmt::Short, radix, out);
                }
                out.push_str(" }");
                true
            }
            (ValueData::Collection(elems), DbgFmt::Long) => {
                let _ = write!(out, "<{} elements>", elems.len());
                true
            }
            _ => false,
        }
    }
}

/// Cache of reusable temp values, keyed by class id and const flag.
#[derive(Debug, Default)]
pub struct TempPool {
    pools: AHashMap<(ClassId, bool), Vec<ValueId>>,
}

impl TempPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrows a temp of the given class, creating one when every pooled
    /// value is in use. The returned value is reset to its default state
    /// and flagged in-use until released.
    pub fn borrow(
        &mut self,
        heap: &mut Heap,
        registry: &ClassRegistry,
        class_id: ClassId,
        is_const: bool,
    ) -> Result<ValueId, NativeError> {
        let pool = self.pools.entry((class_id, is_const)).or_default();
        for &id in pool.iter() {
            if !heap.get(id).in_use() {
                let class = registry.class_by_id(class_id)?;
                let fresh = match (class.kind(), Intrinsic::from_id(class_id)) {
                    (ClassKind::Enum(_), _) => ValueData::Enum(0),
                    (ClassKind::Normal, Some(intrinsic)) => ValueData::scalar_default(intrinsic),
                    // structural temps keep their shape; members reset below
                    _ => heap.get(id).data.clone(),
                };
                let value = heap.get_mut(id);
                value.data = fresh;
                value.set_in_use(true);
                return Ok(id);
            }
        }
        let id = heap.make_storage(registry, class_id, is_const)?;
        heap.get_mut(id).set_in_use(true);
        self.pools.get_mut(&(class_id, is_const)).expect("pool just created").push(id);
        Ok(id)
    }

    /// Releases a borrowed temp back to its pool.
    pub fn release(&self, heap: &mut Heap, id: ValueId) {
        heap.get_mut(id).set_in_use(false);
    }

    /// Number of outstanding borrowings, for balance checks in tests.
    #[must_use]
    pub fn in_use_count(&self, heap: &Heap) -> usize {
        self.pools
            .values()
            .flat_map(|pool| pool.iter())
            .filter(|&&id| heap.get(id).in_use())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{class::ClassInfo, intrinsics, types::ClassExt};

    fn registry() -> ClassRegistry {
        let mut reg = ClassRegistry::new();
        intrinsics::register_all(&mut reg).unwrap();
        reg
    }

    #[test]
    fn user_storage_mirrors_member_list() {
        let mut reg = registry();
        let mut class = ClassInfo::new("Point", "MEng.User", "MEng.Object", true, ClassExt::NonFinal);
        class.add_member("m_X", Intrinsic::Card4.id(), false, None).unwrap();
        class
            .add_member("m_Y", Intrinsic::Card4.id(), false, Some(ValueData::Card4(7)))
            .unwrap();
        let id = reg.add_class(class).unwrap();

        let mut heap = Heap::new();
        let point = heap.make_storage(&reg, id, false).unwrap();
        let ValueData::User(members) = &heap.get(point).data else {
            panic!("expected user storage");
        };
        assert_eq!(members.len(), 2);
        assert_eq!(heap.get(members[0]).data, ValueData::Card4(0));
        assert_eq!(heap.get(members[1]).data, ValueData::Card4(7));

        heap.free(point);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn copy_requires_same_copyable_class() {
        let mut reg = registry();
        let mut heap = Heap::new();
        let a = heap.make_storage(&reg, Intrinsic::Card4.id(), false).unwrap();
        let b = heap.make_storage(&reg, Intrinsic::Card4.id(), false).unwrap();
        heap.get_mut(b).data = ValueData::Card4(42);
        heap.copy_value(&reg, a, b).unwrap();
        assert_eq!(heap.get(a).data, ValueData::Card4(42));

        let s = heap.make_storage(&reg, Intrinsic::String.id(), false).unwrap();
        assert!(heap.copy_value(&reg, a, s).is_err());

        // a class with a non-copyable member is itself non-copyable
        let mut class = ClassInfo::new("Holder", "MEng.User", "MEng.Object", true, ClassExt::NonFinal);
        class
            .add_member("m_Strm", Intrinsic::StringOutStream.id(), false, None)
            .unwrap();
        class.set_copyable(false);
        let holder = reg.add_class(class).unwrap();
        let h1 = heap.make_storage(&reg, holder, false).unwrap();
        let h2 = heap.make_storage(&reg, holder, false).unwrap();
        assert!(heap.copy_value(&reg, h1, h2).is_err());
    }

    #[test]
    fn temp_pool_reuses_released_values() {
        let reg = registry();
        let mut heap = Heap::new();
        let mut pool = TempPool::new();

        let first = pool.borrow(&mut heap, &reg, Intrinsic::Card4.id(), false).unwrap();
        assert_eq!(pool.in_use_count(&heap), 1);
        let second = pool.borrow(&mut heap, &reg, Intrinsic::Card4.id(), false).unwrap();
        assert_ne!(first, second);

        pool.release(&mut heap, first);
        assert_eq!(pool.in_use_count(&heap), 1);
        let third = pool.borrow(&mut heap, &reg, Intrinsic::Card4.id(), false).unwrap();
        assert_eq!(third, first);

        // reuse resets stale payloads
        heap.get_mut(third).data = ValueData::Card4(99);
        pool.release(&mut heap, third);
        let fourth = pool.borrow(&mut heap, &reg, Intrinsic::Card4.id(), false).unwrap();
        assert_eq!(heap.get(fourth).data, ValueData::Card4(0));
    }
}

//! The class model: one [`ClassInfo`] per registered class.
//!
//! A class is identified by its dotted path (always rooted at `MEng`) and
//! by the 16-bit id the registry assigns at registration. It owns its
//! member and method lists — ancestors' entries first, own entries after
//! the `first_member_id` / `first_method_id` split — plus the method
//! implementations for its own and overridden methods, its literals,
//! imports, nested types, and directives. Classes are immutable once the
//! parse that created them completes.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::{
    error::NativeError,
    method::{MethodImpl, MethodInfo},
    types::{BAD_ID, ClassExt, ClassId, MemberId, MethodId},
    value::ValueData,
};

/// One declared field of a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    pub class_id: ClassId,
    pub is_const: bool,
    /// 1-based position within the owning class, inherited members first.
    pub id: MemberId,
    /// Literal initializer for primitive members, applied at construction.
    pub init: Option<ValueData>,
}

/// A named per-class constant of a fundamental type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteralValue {
    pub name: String,
    pub class_id: ClassId,
    pub data: ValueData,
}

/// One value of an enumerated class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumItem {
    pub name: String,
    /// Human-readable error/display text.
    pub text: String,
    /// Optional numeric mapping; defaults to the ordinal.
    pub map_val: u32,
}

/// What kind of storage instances of the class carry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum ClassKind {
    /// Intrinsic scalar or user-defined class with member storage.
    #[default]
    Normal,
    /// An enumeration; instances hold an ordinal into the item list.
    Enum(Vec<EnumItem>),
    /// Fixed-size array of a registered element class.
    Array { elem: ClassId, size: u32 },
    /// Growable vector of a registered element class.
    Vector { elem: ClassId },
}

/// A registered class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassInfo {
    name: String,
    base_path: String,
    class_path: String,
    parent_path: String,
    parent_id: ClassId,
    id: ClassId,
    ext: ClassExt,
    copyable: bool,
    kind: ClassKind,
    members: Vec<MemberInfo>,
    first_member_id: MemberId,
    methods: Vec<MethodInfo>,
    first_method_id: MethodId,
    impls: Vec<MethodImpl>,
    literals: IndexMap<String, LiteralValue>,
    /// Imported class paths; true when the import was pulled in implicitly
    /// as a nested type of another import.
    imports: IndexMap<String, bool>,
    /// Class paths of the nested types this class defines.
    nested: IndexSet<String>,
    directives: IndexMap<String, String>,
    def_ctor_id: MethodId,
}

impl ClassInfo {
    /// Creates an unregistered class. The registry assigns the id; the
    /// parent link is completed by [`Self::base_class_init`] once the
    /// parent is resolvable.
    #[must_use]
    pub fn new(name: &str, base_path: &str, parent_path: &str, copyable: bool, ext: ClassExt) -> Self {
        Self {
            name: name.to_owned(),
            base_path: base_path.to_owned(),
            class_path: format!("{base_path}.{name}"),
            parent_path: parent_path.to_owned(),
            parent_id: BAD_ID,
            id: BAD_ID,
            ext,
            copyable,
            kind: ClassKind::Normal,
            members: Vec::new(),
            first_member_id: 1,
            methods: Vec::new(),
            first_method_id: 1,
            impls: Vec::new(),
            literals: IndexMap::new(),
            imports: IndexMap::new(),
            nested: IndexSet::new(),
            directives: IndexMap::new(),
            def_ctor_id: BAD_ID,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    #[must_use]
    pub fn class_path(&self) -> &str {
        &self.class_path
    }

    #[must_use]
    pub fn parent_path(&self) -> &str {
        &self.parent_path
    }

    #[must_use]
    pub fn parent_id(&self) -> ClassId {
        self.parent_id
    }

    #[must_use]
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: ClassId) {
        self.id = id;
    }

    #[must_use]
    pub fn ext(&self) -> ClassExt {
        self.ext
    }

    #[must_use]
    pub fn is_copyable(&self) -> bool {
        self.copyable
    }

    /// Cleared by the parser when an own member's type is not copyable.
    pub fn set_copyable(&mut self, copyable: bool) {
        self.copyable = copyable;
    }

    #[must_use]
    pub fn kind(&self) -> &ClassKind {
        &self.kind
    }

    pub fn set_kind(&mut self, kind: ClassKind) {
        self.kind = kind;
    }

    /// Completes the inheritance link: copies the parent's member and
    /// method lists (ids preserved), marks where this class's own slots
    /// begin, and propagates copyability.
    pub fn base_class_init(&mut self, parent: &Self) {
        debug_assert!(self.members.is_empty() && self.methods.is_empty(), "base_class_init runs before own slots");
        self.parent_id = parent.id;
        self.members = parent.members.clone();
        self.methods = parent.methods.clone();
        self.first_member_id = (self.members.len() + 1) as MemberId;
        self.first_method_id = (self.methods.len() + 1) as MethodId;
        self.copyable = self.copyable && parent.copyable;
    }

    // ----- members ---------------------------------------------------------

    /// Adds an own member, assigning the next 1-based id.
    pub fn add_member(
        &mut self,
        name: &str,
        class_id: ClassId,
        is_const: bool,
        init: Option<ValueData>,
    ) -> Result<MemberId, NativeError> {
        if self.members.len() + 1 >= usize::from(BAD_ID) {
            return Err(NativeError::Capacity("member"));
        }
        let id = (self.members.len() + 1) as MemberId;
        self.members.push(MemberInfo {
            name: name.to_owned(),
            class_id,
            is_const,
            id,
            init,
        });
        Ok(id)
    }

    #[must_use]
    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// First id that belongs to this class rather than an ancestor.
    #[must_use]
    pub fn first_member_id(&self) -> MemberId {
        self.first_member_id
    }

    /// Looks up a member by 1-based id.
    #[must_use]
    pub fn member(&self, id: MemberId) -> Option<&MemberInfo> {
        id.checked_sub(1).and_then(|ix| self.members.get(usize::from(ix)))
    }

    /// Finds a member by name, optionally restricted to own members.
    #[must_use]
    pub fn find_member(&self, name: &str, this_class_only: bool) -> Option<&MemberInfo> {
        self.members
            .iter()
            .find(|m| m.name == name && (!this_class_only || m.id >= self.first_member_id))
    }

    // ----- methods ---------------------------------------------------------

    /// Adds an own method descriptor, assigning the next 1-based id.
    pub fn add_method(&mut self, mut method: MethodInfo) -> Result<MethodId, NativeError> {
        if self.methods.len() + 1 >= usize::from(BAD_ID) {
            return Err(NativeError::Capacity("method"));
        }
        let id = (self.methods.len() + 1) as MethodId;
        method.set_id(id);
        if method.is_ctor() && method.parm_count() == 0 {
            self.def_ctor_id = id;
        }
        self.methods.push(method);
        Ok(id)
    }

    #[must_use]
    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }

    #[must_use]
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// First id that belongs to this class rather than an ancestor.
    #[must_use]
    pub fn first_method_id(&self) -> MethodId {
        self.first_method_id
    }

    /// Looks up a method descriptor by 1-based id.
    #[must_use]
    pub fn method(&self, id: MethodId) -> Option<&MethodInfo> {
        id.checked_sub(1).and_then(|ix| self.methods.get(usize::from(ix)))
    }

    pub(crate) fn method_mut(&mut self, id: MethodId) -> Option<&mut MethodInfo> {
        id.checked_sub(1).and_then(|ix| self.methods.get_mut(usize::from(ix)))
    }

    #[must_use]
    pub fn find_method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name() == name)
    }

    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.find_method(name).is_some()
    }

    /// Id of the zero-parameter constructor, if the class has one.
    #[must_use]
    pub fn def_ctor_id(&self) -> Option<MethodId> {
        (self.def_ctor_id != BAD_ID).then_some(self.def_ctor_id)
    }

    /// Adds an implementation for an own or overridden method.
    pub fn add_method_impl(&mut self, method_impl: MethodImpl) {
        self.impls.push(method_impl);
    }

    /// This class's own implementation of a method, if it has one. Callers
    /// walk the parent chain through the registry when it does not.
    #[must_use]
    pub fn impl_for(&self, method_id: MethodId) -> Option<&MethodImpl> {
        self.impls.iter().find(|i| i.method_id() == method_id)
    }

    #[must_use]
    pub fn impls(&self) -> &[MethodImpl] {
        &self.impls
    }

    // ----- literals, imports, nested types, directives ---------------------

    /// Adds an own literal. Returns false when the name is taken.
    pub fn add_literal(&mut self, literal: LiteralValue) -> bool {
        if self.literals.contains_key(&literal.name) {
            return false;
        }
        self.literals.insert(literal.name.clone(), literal);
        true
    }

    /// Finds an own literal; ancestor literals are found through the
    /// registry's recursive lookup.
    #[must_use]
    pub fn find_literal(&self, name: &str) -> Option<&LiteralValue> {
        self.literals.get(name)
    }

    #[must_use]
    pub fn literals(&self) -> impl Iterator<Item = &LiteralValue> {
        self.literals.values()
    }

    /// Records an import. Returns false when already imported.
    pub fn add_import(&mut self, class_path: &str, nested: bool) -> bool {
        if self.imports.contains_key(class_path) {
            return false;
        }
        self.imports.insert(class_path.to_owned(), nested);
        true
    }

    #[must_use]
    pub fn imports_class(&self, class_path: &str) -> bool {
        self.imports.contains_key(class_path)
    }

    #[must_use]
    pub fn imports(&self) -> impl Iterator<Item = &str> {
        self.imports.keys().map(String::as_str)
    }

    /// Records a nested type defined by this class. Returns false on dup.
    pub fn add_nested(&mut self, class_path: &str) -> bool {
        self.nested.insert(class_path.to_owned())
    }

    #[must_use]
    pub fn nested_types(&self) -> impl Iterator<Item = &str> {
        self.nested.iter().map(String::as_str)
    }

    pub fn add_directive(&mut self, key: &str, value: &str) {
        self.directives.insert(key.to_owned(), value.to_owned());
    }

    #[must_use]
    pub fn find_directive(&self, key: &str) -> Option<&str> {
        self.directives.get(key).map(String::as_str)
    }

    // ----- enum classes ----------------------------------------------------

    /// Items of an enumerated class; empty for other kinds.
    #[must_use]
    pub fn enum_items(&self) -> &[EnumItem] {
        match &self.kind {
            ClassKind::Enum(items) => items,
            _ => &[],
        }
    }

    #[must_use]
    pub fn enum_item(&self, ordinal: u32) -> Option<&EnumItem> {
        self.enum_items().get(ordinal as usize)
    }

    #[must_use]
    pub fn ordinal_from_name(&self, name: &str) -> Option<u32> {
        self.enum_items().iter().position(|i| i.name == name).map(|ix| ix as u32)
    }

    /// Highest valid ordinal, for `CondEnumInc`.
    #[must_use]
    pub fn max_ordinal(&self) -> u32 {
        self.enum_items().len().saturating_sub(1) as u32
    }

    // ----- collections -----------------------------------------------------

    /// Element class for array/vector classes.
    #[must_use]
    pub fn elem_class(&self) -> Option<ClassId> {
        match self.kind {
            ClassKind::Array { elem, .. } | ClassKind::Vector { elem } => Some(elem),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_collection(&self) -> bool {
        matches!(self.kind, ClassKind::Array { .. } | ClassKind::Vector { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Intrinsic, MethodExt, Visibility};

    fn class(name: &str) -> ClassInfo {
        ClassInfo::new(name, "MEng.User", "MEng.Object", true, ClassExt::NonFinal)
    }

    #[test]
    fn member_and_method_ids_are_one_based() {
        let mut c = class("A");
        let m1 = c.add_member("m_First", Intrinsic::Card4.id(), false, None).unwrap();
        let m2 = c.add_member("m_Second", Intrinsic::String.id(), false, None).unwrap();
        assert_eq!((m1, m2), (1, 2));
        assert_eq!(c.member(1).unwrap().name, "m_First");
        assert_eq!(c.member(0), None);

        let id = c
            .add_method(MethodInfo::new_void("DoIt", Visibility::Public, MethodExt::NonFinal))
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(c.method(id).unwrap().name(), "DoIt");
    }

    #[test]
    fn base_class_init_concatenates_and_splits() {
        let mut parent = class("Base");
        parent.set_id(40);
        parent.add_member("m_Inherited", Intrinsic::Card4.id(), false, None).unwrap();
        parent
            .add_method(MethodInfo::new_void("FromBase", Visibility::Public, MethodExt::NonFinal))
            .unwrap();

        let mut child = class("Derived");
        child.base_class_init(&parent);
        assert_eq!(child.parent_id(), 40);
        assert_eq!(child.first_member_id(), 2);
        assert_eq!(child.first_method_id(), 2);
        // inherited entries keep their ids
        assert_eq!(child.member(1).unwrap().name, "m_Inherited");
        assert_eq!(child.method(1).unwrap().name(), "FromBase");

        let own = child.add_member("m_Own", Intrinsic::String.id(), false, None).unwrap();
        assert_eq!(own, 2);
        assert!(child.find_member("m_Own", true).is_some());
        assert!(child.find_member("m_Inherited", true).is_none());
        assert!(child.find_member("m_Inherited", false).is_some());
    }

    #[test]
    fn copyability_propagates_from_parent() {
        let mut parent = class("NoCopy");
        parent.set_id(40);
        parent.set_copyable(false);

        let mut child = class("Child");
        child.base_class_init(&parent);
        assert!(!child.is_copyable());
    }

    #[test]
    fn default_ctor_is_tracked() {
        let mut c = class("A");
        assert_eq!(c.def_ctor_id(), None);
        let ctor = MethodInfo::new_void("ctor", Visibility::Public, MethodExt::Final).set_ctor(true);
        let id = c.add_method(ctor).unwrap();
        assert_eq!(c.def_ctor_id(), Some(id));
    }

    #[test]
    fn enum_lookup() {
        let mut c = class("Errors");
        c.set_kind(ClassKind::Enum(vec![
            EnumItem {
                name: "First".into(),
                text: "first error".into(),
                map_val: 0,
            },
            EnumItem {
                name: "Second".into(),
                text: "second error".into(),
                map_val: 1,
            },
        ]));
        assert_eq!(c.ordinal_from_name("Second"), Some(1));
        assert_eq!(c.ordinal_from_name("Third"), None);
        assert_eq!(c.enum_item(0).unwrap().text, "first error");
        assert_eq!(c.max_ordinal(), 1);
    }
}

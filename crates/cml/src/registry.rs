//! The class registry: every loaded class, indexed two ways.
//!
//! A path map serves parse-time name resolution; an id-indexed vector
//! serves the interpreter, where opcodes carry class ids and lookup must be
//! O(1). Ids are assigned in registration order, which is what pins the
//! intrinsic ids (registered first, in fixed order) to known constants.
//!
//! The registry is effectively immutable once parsing completes; runtime
//! lookups take `&self` and need no coordination.

use ahash::AHashMap;

use crate::{
    class::{ClassInfo, LiteralValue},
    error::NativeError,
    method::MethodImpl,
    types::{BAD_ID, ClassId, ClassMatch, Dispatch, MethodId},
};

/// Catalog of all registered classes.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<ClassInfo>,
    by_path: AHashMap<String, ClassId>,
}

impl ClassRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Registers a class whose parent is already registered, completing the
    /// inheritance link immediately.
    pub fn add_class(&mut self, mut class: ClassInfo) -> Result<ClassId, NativeError> {
        let parent_id = self.find_class_id(class.parent_path())?;
        let parent = &self.classes[usize::from(parent_id)];
        class.base_class_init(parent);
        self.insert(class)
    }

    /// Reserves a slot for a class whose parent is not yet registered.
    ///
    /// The caller must finish the link with [`Self::complete_deferred`]
    /// before the class is used.
    pub fn add_class_deferred(&mut self, class: ClassInfo) -> Result<ClassId, NativeError> {
        self.insert(class)
    }

    /// Runs the deferred inheritance link once the parent is resolvable.
    pub fn complete_deferred(&mut self, id: ClassId) -> Result<(), NativeError> {
        let parent_path = self.class_by_id(id)?.parent_path().to_owned();
        let parent_id = self.find_class_id(&parent_path)?;
        let (class, parent) = self.pair_mut(id, parent_id);
        class.base_class_init(parent);
        Ok(())
    }

    /// Registers the root class, which has no parent.
    pub(crate) fn add_root_class(&mut self, class: ClassInfo) -> Result<ClassId, NativeError> {
        self.insert(class)
    }

    fn insert(&mut self, mut class: ClassInfo) -> Result<ClassId, NativeError> {
        if self.classes.len() >= usize::from(BAD_ID) {
            return Err(NativeError::Capacity("class"));
        }
        let id = self.classes.len() as ClassId;
        class.set_id(id);
        self.by_path.insert(class.class_path().to_owned(), id);
        self.classes.push(class);
        Ok(id)
    }

    /// Splits mutable access to a class and shared access to its parent.
    fn pair_mut(&mut self, id: ClassId, parent_id: ClassId) -> (&mut ClassInfo, &ClassInfo) {
        debug_assert_ne!(id, parent_id);
        let (id, parent_id) = (usize::from(id), usize::from(parent_id));
        if id > parent_id {
            let (head, tail) = self.classes.split_at_mut(id);
            (&mut tail[0], &head[parent_id])
        } else {
            let (head, tail) = self.classes.split_at_mut(parent_id);
            (&mut head[id], &tail[0])
        }
    }

    /// Re-inserts a class restored from a snapshot, without re-running the
    /// inheritance link (the snapshot already carries it).
    pub(crate) fn restore_class(&mut self, class: ClassInfo) -> Result<ClassId, NativeError> {
        self.insert(class)
    }

    /// Rolls the registry back to a checkpoint count, dropping everything
    /// registered since. Used to discard a failed parse so no class is
    /// partially left behind.
    pub fn truncate(&mut self, count: usize) {
        for class in self.classes.drain(count..) {
            self.by_path.remove(class.class_path());
        }
    }

    // ----- lookup ----------------------------------------------------------

    /// Direct id lookup with a bounds check.
    pub fn class_by_id(&self, id: ClassId) -> Result<&ClassInfo, NativeError> {
        self.classes.get(usize::from(id)).ok_or(NativeError::BadClassId(id))
    }

    pub(crate) fn class_by_id_mut(&mut self, id: ClassId) -> Result<&mut ClassInfo, NativeError> {
        self.classes.get_mut(usize::from(id)).ok_or(NativeError::BadClassId(id))
    }

    /// Exact path lookup.
    #[must_use]
    pub fn class_by_path(&self, path: &str) -> Option<&ClassInfo> {
        self.by_path.get(path).map(|&id| &self.classes[usize::from(id)])
    }

    pub fn find_class_id(&self, path: &str) -> Result<ClassId, NativeError> {
        self.by_path
            .get(path)
            .copied()
            .ok_or_else(|| NativeError::UnknownClass(path.to_owned()))
    }

    #[must_use]
    pub fn is_loaded(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    #[must_use]
    pub fn classes(&self) -> &[ClassInfo] {
        &self.classes
    }

    /// Whether `id` is `base` or derives from it.
    #[must_use]
    pub fn is_derived_from(&self, id: ClassId, base: ClassId) -> bool {
        let mut cur = id;
        loop {
            if cur == base {
                return true;
            }
            match self.classes.get(usize::from(cur)) {
                Some(class) if class.parent_id() != BAD_ID => cur = class.parent_id(),
                _ => return false,
            }
        }
    }

    #[must_use]
    pub fn is_copyable(&self, id: ClassId) -> bool {
        self.classes.get(usize::from(id)).is_some_and(ClassInfo::is_copyable)
    }

    /// Resolves a class name used inside `importer`.
    ///
    /// A full path matches exactly. A short name (or partial trailing path)
    /// is matched against the importer's import set; when it matches more
    /// than one import the result is `Ambiguous` and the caller must
    /// require a fuller path — no precedence is applied.
    pub fn resolve_name(&self, name: &str, importer: &ClassInfo) -> Result<ClassId, ClassMatch> {
        if let Some(&id) = self.by_path.get(name) {
            return Ok(id);
        }
        let suffix = format!(".{name}");
        let mut found: Option<ClassId> = None;
        for import in importer.imports() {
            if import.ends_with(&suffix) {
                if let Some(&id) = self.by_path.get(import) {
                    if found.is_some_and(|prev| prev != id) {
                        return Err(ClassMatch::Ambiguous);
                    }
                    found = Some(id);
                }
            }
        }
        found.ok_or(ClassMatch::NotFound)
    }

    /// Finds a literal visible on a class, walking the ancestor chain.
    #[must_use]
    pub fn find_literal(&self, class_id: ClassId, name: &str) -> Option<(&LiteralValue, ClassId)> {
        let mut cur = class_id;
        loop {
            let class = self.classes.get(usize::from(cur))?;
            if let Some(literal) = class.find_literal(name) {
                return Some((literal, cur));
            }
            if class.parent_id() == BAD_ID {
                return None;
            }
            cur = class.parent_id();
        }
    }

    /// Finds the implementation that a call on `class_id` dispatches to.
    ///
    /// Poly dispatch starts at the receiver's runtime class; Mono dispatch
    /// starts at the statically named class (parent calls pass the parent
    /// id). Either way the walk continues up the chain until a class
    /// provides an implementation for the method id.
    #[must_use]
    pub fn find_impl(&self, class_id: ClassId, method_id: MethodId, dispatch: Dispatch) -> Option<(&MethodImpl, ClassId)> {
        let _ = dispatch; // both modes walk up from the starting class
        let mut cur = class_id;
        loop {
            let class = self.classes.get(usize::from(cur))?;
            if let Some(found) = class.impl_for(method_id) {
                return Some((found, cur));
            }
            if class.parent_id() == BAD_ID {
                return None;
            }
            cur = class.parent_id();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::ClassExt;

    fn registry_with_root() -> ClassRegistry {
        let mut reg = ClassRegistry::new();
        let root = ClassInfo::new("Object", "MEng", "", false, ClassExt::Abstract);
        reg.add_root_class(root).unwrap();
        reg
    }

    fn user_class(name: &str) -> ClassInfo {
        ClassInfo::new(name, "MEng.User", "MEng.Object", true, ClassExt::NonFinal)
    }

    #[test]
    fn path_and_id_lookup_agree() {
        let mut reg = registry_with_root();
        let id = reg.add_class(user_class("A")).unwrap();
        let by_path = reg.class_by_path("MEng.User.A").unwrap();
        assert_eq!(by_path.id(), id);
        assert_eq!(reg.class_by_id(id).unwrap().class_path(), "MEng.User.A");
        assert!(reg.class_by_id(500).is_err());
    }

    #[test]
    fn deferred_registration_completes_later() {
        let mut reg = registry_with_root();
        let child = reg.add_class_deferred(user_class("Child")).unwrap();
        // parent arrives after the child reserved its slot
        reg.add_class(user_class("Parent")).unwrap();
        let pending = ClassInfo::new("Child2", "MEng.User", "MEng.User.Parent", true, ClassExt::NonFinal);
        let pending_id = reg.add_class_deferred(pending).unwrap();
        reg.complete_deferred(pending_id).unwrap();
        assert_eq!(
            reg.class_by_id(pending_id).unwrap().parent_id(),
            reg.find_class_id("MEng.User.Parent").unwrap()
        );
        // the first deferred class still links to the root
        reg.complete_deferred(child).unwrap();
        assert_eq!(reg.class_by_id(child).unwrap().parent_id(), 0);
    }

    #[test]
    fn truncate_rolls_back_both_structures() {
        let mut reg = registry_with_root();
        let checkpoint = reg.class_count();
        reg.add_class(user_class("Doomed")).unwrap();
        assert!(reg.is_loaded("MEng.User.Doomed"));
        reg.truncate(checkpoint);
        assert!(!reg.is_loaded("MEng.User.Doomed"));
        assert_eq!(reg.class_count(), checkpoint);
    }

    #[test]
    fn short_name_resolution_reports_ambiguity() {
        let mut reg = registry_with_root();
        reg.add_class(ClassInfo::new("Helper", "MEng.User.A", "MEng.Object", true, ClassExt::NonFinal))
            .unwrap();
        reg.add_class(ClassInfo::new("Helper", "MEng.User.B", "MEng.Object", true, ClassExt::NonFinal))
            .unwrap();

        let mut importer = user_class("Main");
        importer.add_import("MEng.User.A.Helper", false);
        assert!(reg.resolve_name("Helper", &importer).is_ok());

        importer.add_import("MEng.User.B.Helper", false);
        assert_eq!(reg.resolve_name("Helper", &importer), Err(ClassMatch::Ambiguous));
        assert_eq!(reg.resolve_name("Missing", &importer), Err(ClassMatch::NotFound));

        // a full path always resolves uniquely
        assert!(reg.resolve_name("MEng.User.B.Helper", &importer).is_ok());
    }

    #[test]
    fn derivation_walks_the_parent_chain() {
        let mut reg = registry_with_root();
        let a = reg.add_class(user_class("A")).unwrap();
        let b = reg
            .add_class(ClassInfo::new("B", "MEng.User", "MEng.User.A", true, ClassExt::NonFinal))
            .unwrap();
        assert!(reg.is_derived_from(b, a));
        assert!(reg.is_derived_from(b, 0));
        assert!(!reg.is_derived_from(a, b));
    }
}

//! Class managers: how the engine obtains macro class source.
//!
//! The engine never touches storage itself. The host supplies a
//! [`ClassManager`] that maps class paths to source text, and optionally
//! external [`ClassLoader`]s that can materialize whole compiled classes
//! (the mechanism the intrinsic runtime libraries use). Two prefab managers
//! cover the common cases: a fixed base directory on disk and an in-memory
//! map for hosts that embed their macro source.

use std::{
    fs,
    path::{Path, PathBuf},
};

use ahash::AHashMap;

use crate::{class::ClassInfo, error::NativeError};

/// File extension for macro class source files.
pub const CLASS_FILE_EXT: &str = "mengc";

/// Access mode requested for class source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResMode {
    ReadOnly,
    ReadWrite,
}

/// Host-supplied access to macro class source text.
pub trait ClassManager {
    /// Whether source exists for the class path.
    fn exists(&self, class_path: &str) -> bool;

    /// Opens the source text for a class path.
    fn load(&mut self, class_path: &str, mode: ResMode) -> Result<String, NativeError>;

    /// Stores updated source for a class path.
    fn store(&mut self, class_path: &str, text: &str) -> Result<(), NativeError>;

    /// Releases a read-write reservation taken by an earlier load.
    fn undo_write_mode(&mut self, _class_path: &str) {}

    /// Interactively selects a class, for IDE-style hosts. Returns the
    /// chosen class path, or None when the selection was cancelled.
    fn select(&mut self, _mode: ResMode) -> Option<String> {
        None
    }
}

/// Maps class paths directly to files under a fixed base directory.
///
/// `MEng.User.MyClass` becomes `<base>/User/MyClass.mengc`; the reserved
/// root segment is dropped. Paths that would escape the base directory are
/// rejected.
#[derive(Debug)]
pub struct FixedBaseClassManager {
    base_dir: PathBuf,
}

impl FixedBaseClassManager {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_for(&self, class_path: &str) -> Result<PathBuf, NativeError> {
        let relative = class_path.strip_prefix("MEng.").unwrap_or(class_path);
        let mut path = self.base_dir.clone();
        for segment in relative.split('.') {
            if segment.is_empty() || segment == ".." {
                return Err(NativeError::ClassIo(format!("bad class path '{class_path}'")));
            }
            path.push(segment);
        }
        path.set_extension(CLASS_FILE_EXT);
        Ok(path)
    }
}

impl ClassManager for FixedBaseClassManager {
    fn exists(&self, class_path: &str) -> bool {
        self.file_for(class_path).is_ok_and(|p| p.is_file())
    }

    fn load(&mut self, class_path: &str, _mode: ResMode) -> Result<String, NativeError> {
        let path = self.file_for(class_path)?;
        fs::read_to_string(&path).map_err(|e| NativeError::ClassIo(format!("{}: {e}", path.display())))
    }

    fn store(&mut self, class_path: &str, text: &str) -> Result<(), NativeError> {
        let path = self.file_for(class_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| NativeError::ClassIo(format!("{}: {e}", parent.display())))?;
        }
        fs::write(&path, text).map_err(|e| NativeError::ClassIo(format!("{}: {e}", path.display())))
    }
}

/// In-memory class manager over a path -> source map.
#[derive(Debug, Default)]
pub struct MemClassManager {
    classes: AHashMap<String, String>,
}

impl MemClassManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the source for a class path.
    pub fn add_class(&mut self, class_path: &str, text: &str) -> &mut Self {
        self.classes.insert(class_path.to_owned(), text.to_owned());
        self
    }
}

impl ClassManager for MemClassManager {
    fn exists(&self, class_path: &str) -> bool {
        self.classes.contains_key(class_path)
    }

    fn load(&mut self, class_path: &str, _mode: ResMode) -> Result<String, NativeError> {
        self.classes
            .get(class_path)
            .cloned()
            .ok_or_else(|| NativeError::UnknownClass(class_path.to_owned()))
    }

    fn store(&mut self, class_path: &str, text: &str) -> Result<(), NativeError> {
        self.classes.insert(class_path.to_owned(), text.to_owned());
        Ok(())
    }
}

/// Where a registered class loader sits in the lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderEnd {
    First,
    Last,
}

/// External loader that can materialize a compiled class by path.
///
/// Consulted before source parsing when an import is not yet registered;
/// the runtime library families are installed this way.
pub trait ClassLoader {
    /// Returns the compiled class for the path, or None when this loader
    /// does not provide it.
    fn load_class(&mut self, class_path: &str) -> Option<ClassInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_base_maps_dotted_paths_under_base() {
        let mgr = FixedBaseClassManager::new("/tmp/macros");
        let path = mgr.file_for("MEng.User.Tests.Hello").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/macros/User/Tests/Hello.mengc"));
    }

    #[test]
    fn fixed_base_rejects_uplevel_segments() {
        let mgr = FixedBaseClassManager::new("/tmp/macros");
        assert!(mgr.file_for("MEng...Escape").is_err());
    }

    #[test]
    fn mem_manager_round_trip() {
        let mut mgr = MemClassManager::new();
        mgr.add_class("MEng.User.A", "Class=...");
        assert!(mgr.exists("MEng.User.A"));
        assert!(!mgr.exists("MEng.User.B"));
        assert_eq!(mgr.load("MEng.User.A", ResMode::ReadOnly).unwrap(), "Class=...");
        assert!(mgr.load("MEng.User.B", ResMode::ReadOnly).is_err());
    }
}

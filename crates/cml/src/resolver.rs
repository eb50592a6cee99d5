//! File path resolution between macro-visible paths and host OS paths.
//!
//! Macros that touch files see a virtual, forward-slash path space. The
//! host installs a [`FileResolver`] to expand those into real OS paths and
//! contract OS paths back for display. The prefab implementation roots the
//! virtual space under a configured base directory and refuses anything
//! that would climb out of it.

use std::path::{Component, Path, PathBuf};

use crate::error::NativeError;

/// Host-supplied mapping between macro paths and OS paths.
pub trait FileResolver {
    /// Expands a macro-visible path into a host OS path.
    fn expand(&self, macro_path: &str) -> Result<PathBuf, NativeError>;

    /// Contracts a host OS path back into the macro-visible form.
    fn contract(&self, os_path: &Path) -> Result<String, NativeError>;
}

/// Resolver that prepends a fixed base directory.
#[derive(Debug)]
pub struct FixedBaseFileResolver {
    base_dir: PathBuf,
}

impl FixedBaseFileResolver {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl FileResolver for FixedBaseFileResolver {
    fn expand(&self, macro_path: &str) -> Result<PathBuf, NativeError> {
        let trimmed = macro_path.trim_start_matches('/');
        let relative = Path::new(trimmed);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(NativeError::ClassIo(format!("bad macro path '{macro_path}'"))),
            }
        }
        Ok(self.base_dir.join(relative))
    }

    fn contract(&self, os_path: &Path) -> Result<String, NativeError> {
        let relative = os_path
            .strip_prefix(&self.base_dir)
            .map_err(|_| NativeError::ClassIo(format!("'{}' is outside the macro file root", os_path.display())))?;
        let mut out = String::from("/");
        let mut first = true;
        for component in relative.components() {
            if let Component::Normal(part) = component {
                if !first {
                    out.push('/');
                }
                out.push_str(&part.to_string_lossy());
                first = false;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_and_contract_are_inverse() {
        let resolver = FixedBaseFileResolver::new("/data/macrofiles");
        let os = resolver.expand("/Logs/today.txt").unwrap();
        assert_eq!(os, PathBuf::from("/data/macrofiles/Logs/today.txt"));
        assert_eq!(resolver.contract(&os).unwrap(), "/Logs/today.txt");
    }

    #[test]
    fn uplevel_segments_are_rejected() {
        let resolver = FixedBaseFileResolver::new("/data/macrofiles");
        assert!(resolver.expand("/Logs/../../etc/passwd").is_err());
    }

    #[test]
    fn outside_paths_do_not_contract() {
        let resolver = FixedBaseFileResolver::new("/data/macrofiles");
        assert!(resolver.contract(Path::new("/etc/passwd")).is_err());
    }
}

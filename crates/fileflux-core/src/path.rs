//! Logical paths: a storage scope plus a normalized virtual path.

use std::fmt;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Name of a storage partition.
///
/// Each scope resolves to exactly one backend and carries its own quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageScope(CompactString);

impl StorageScope {
    /// Create a scope from its name.
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self(name.into())
    }

    /// The scope name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorageScope {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A normalized `/`-separated path inside a scope.
///
/// Normalization drops empty and `.` components and resolves `..` without
/// ever climbing above the root. The root is the empty path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VirtualPath(CompactString);

impl VirtualPath {
    /// Parse and normalize a path.
    pub fn new(raw: &str) -> Self {
        let mut parts: Vec<&str> = Vec::new();
        for component in raw.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => parts.push(name),
            }
        }
        Self(CompactString::from(parts.join("/")))
    }

    /// The root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Whether this is the root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The normalized path without a leading separator.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the path components.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Number of components; zero for the root.
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Append a relative path.
    pub fn join(&self, child: &str) -> Self {
        if self.is_root() {
            Self::new(child)
        } else {
            Self::new(&format!("{}/{}", self.0, child))
        }
    }

    /// Append every component of another virtual path.
    pub fn join_path(&self, child: &VirtualPath) -> Self {
        self.join(child.as_str())
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(Self(CompactString::from(&self.0[..idx]))),
            None => Some(Self::root()),
        }
    }

    /// The last component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &VirtualPath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(self.0.as_str())
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// The path of `self` relative to `base`.
    ///
    /// Returns the root when both are equal and `None` when `base` is not an
    /// ancestor of `self`.
    pub fn relative_to(&self, base: &VirtualPath) -> Option<Self> {
        if self == base {
            return Some(Self::root());
        }
        if !base.is_ancestor_of(self) {
            return None;
        }
        let start = if base.is_root() { 0 } else { base.0.len() + 1 };
        Some(Self(CompactString::from(&self.0[start..])))
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for VirtualPath {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// A file or directory location: storage scope plus virtual path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalPath {
    /// Partition the path lives in.
    pub scope: StorageScope,
    /// Path inside the partition.
    pub path: VirtualPath,
}

impl LogicalPath {
    /// Create a logical path.
    pub fn new(scope: impl Into<StorageScope>, path: impl Into<VirtualPath>) -> Self {
        Self {
            scope: scope.into(),
            path: path.into(),
        }
    }

    /// The root of a scope.
    pub fn root_of(scope: impl Into<StorageScope>) -> Self {
        Self::new(scope, VirtualPath::root())
    }

    /// Append a relative path within the same scope.
    pub fn join(&self, child: &str) -> Self {
        Self {
            scope: self.scope.clone(),
            path: self.path.join(child),
        }
    }

    /// Append a relative virtual path within the same scope.
    pub fn join_path(&self, child: &VirtualPath) -> Self {
        Self {
            scope: self.scope.clone(),
            path: self.path.join_path(child),
        }
    }

    /// The parent location, or `None` for a scope root.
    pub fn parent(&self) -> Option<Self> {
        self.path.parent().map(|path| Self {
            scope: self.scope.clone(),
            path,
        })
    }

    /// The last path component.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name()
    }

    /// Whether both paths live in the same scope.
    pub fn same_scope(&self, other: &LogicalPath) -> bool {
        self.scope == other.scope
    }

    /// Whether `self` is a strict ancestor of `other` in the same scope.
    pub fn is_ancestor_of(&self, other: &LogicalPath) -> bool {
        self.same_scope(other) && self.path.is_ancestor_of(&other.path)
    }

    /// The path of `self` relative to `base`, if `base` contains it.
    pub fn relative_to(&self, base: &LogicalPath) -> Option<VirtualPath> {
        if !self.same_scope(base) {
            return None;
        }
        self.path.relative_to(&base.path)
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.path)
    }
}

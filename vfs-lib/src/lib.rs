mod config;
mod content_index;
mod tree;
mod upload;

pub mod service;

pub use config::StoreConfig;
pub use content_index::{ContentEntry, ContentIndex};
pub use service::{CheckUploadReq, DownloadTarget, FileAction, FileStoreService, ListEntry};
pub use tree::{DirNode, FileRecord, FileTree, TreeEntry};
pub use upload::{part_file_path, CheckUpload, UploadState};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("name conflict: {0}")]
    Conflict(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("verify error: {0}")]
    VerifyError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl VfsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound(_))
    }
}

pub type VfsResult<T> = std::result::Result<T, VfsError>;

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        VfsError::IoError(err.to_string())
    }
}

/// Client-facing virtual path, independent of the physical storage layout.
#[derive(Debug, Clone)]
pub struct VfsPath(pub String);

impl VfsPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return non-empty path components split by `/`.
    /// Example: `/a/b/` -> ["a", "b"], `/` -> []
    pub fn components(&self) -> Vec<&str> {
        self.0.split('/').filter(|s| !s.is_empty()).collect()
    }

    pub fn join(&self, name: &str) -> VfsPath {
        let base = self.0.trim_end_matches('/');
        if base.is_empty() {
            VfsPath::new(format!("/{}", name))
        } else {
            VfsPath::new(format!("{}/{}", base, name))
        }
    }

    pub fn is_root(&self) -> bool {
        let s = self.0.trim_end_matches('/');
        s.is_empty() || s == "/"
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vfs_path_components() {
        assert_eq!(
            VfsPath::new("/foo/bar/baz").components(),
            vec!["foo", "bar", "baz"]
        );
        assert_eq!(VfsPath::new("/foo/bar/").components(), vec!["foo", "bar"]);
        assert_eq!(VfsPath::new("/").components(), Vec::<&str>::new());
        assert_eq!(VfsPath::new("").components(), Vec::<&str>::new());
    }

    #[test]
    fn test_vfs_path_join() {
        assert_eq!(VfsPath::new("/").join("a").as_str(), "/a");
        assert_eq!(VfsPath::new("").join("a").as_str(), "/a");
        assert_eq!(VfsPath::new("/a/b").join("c").as_str(), "/a/b/c");
        assert_eq!(VfsPath::new("/a/b/").join("c").as_str(), "/a/b/c");
    }

    #[test]
    fn test_vfs_path_is_root() {
        assert!(VfsPath::new("/").is_root());
        assert!(VfsPath::new("").is_root());
        assert!(VfsPath::new("//").is_root());
        assert!(!VfsPath::new("/a").is_root());
    }
}

use crate::upload::UploadState;
use crate::{VfsError, VfsPath, VfsResult};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;

/// One directory level of the virtual tree.
#[derive(Debug)]
pub struct DirNode {
    /// Virtual path of the parent directory, empty for the root.
    pub parent_path: String,
    /// Own name, empty for the root.
    pub name: String,
    /// Physical directory backing this node.
    pub abs_path: PathBuf,
    pub entries: HashMap<String, TreeEntry>,
}

#[derive(Debug)]
pub enum TreeEntry {
    Dir(DirNode),
    File(FileRecord),
}

/// A file leaf. `md5`, `size` and `date` become meaningful once `file_ok`
/// is set; `upload` is present exactly while a transfer is pending.
#[derive(Debug)]
pub struct FileRecord {
    pub name: String,
    pub abs_path: PathBuf,
    pub md5: String,
    pub size: u64,
    pub date: String,
    pub file_ok: bool,
    pub upload: Option<UploadState>,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, abs_path: PathBuf) -> Self {
        Self {
            name: name.into(),
            abs_path,
            md5: String::new(),
            size: 0,
            date: String::new(),
            file_ok: false,
            upload: None,
        }
    }
}

impl DirNode {
    fn new(parent_path: String, name: String, abs_path: PathBuf) -> Self {
        Self {
            parent_path,
            name,
            abs_path,
            entries: HashMap::new(),
        }
    }

    /// Virtual path of this node, "/" for the root.
    pub fn virtual_path(&self) -> String {
        if self.name.is_empty() {
            "/".to_string()
        } else {
            VfsPath::new(self.parent_path.clone())
                .join(&self.name)
                .0
        }
    }
}

/// The whole virtual hierarchy. The tree does no locking of its own;
/// callers serialize access through the service lock.
#[derive(Debug)]
pub struct FileTree {
    root: DirNode,
}

impl FileTree {
    pub fn new(root_abs: PathBuf) -> Self {
        Self {
            root: DirNode::new(String::new(), String::new(), root_abs),
        }
    }

    pub fn root(&self) -> &DirNode {
        &self.root
    }

    /// Resolve a virtual path to its directory node, read-only.
    pub fn find_dir(&self, path: &VfsPath) -> VfsResult<&DirNode> {
        let mut cur = &self.root;
        for seg in path.components() {
            match cur.entries.get(seg) {
                Some(TreeEntry::Dir(dir)) => cur = dir,
                Some(TreeEntry::File(_)) => {
                    return Err(VfsError::Conflict(format!(
                        "{} is a file",
                        VfsPath::new(cur.virtual_path()).join(seg).as_str()
                    )));
                }
                None => {
                    return Err(VfsError::NotFound(format!(
                        "path {} not found",
                        path.as_str()
                    )));
                }
            }
        }
        Ok(cur)
    }

    /// Resolve a virtual path, creating missing directory nodes along the
    /// way when `auto_create` is set. A segment already taken by a file is
    /// a conflict in either mode. The physical path of a created node is
    /// always its parent's physical path joined with the segment name.
    pub fn find_dir_mut(&mut self, path: &VfsPath, auto_create: bool) -> VfsResult<&mut DirNode> {
        let mut cur = &mut self.root;
        for seg in path.components() {
            let child_parent = cur.virtual_path();
            let child_abs = cur.abs_path.join(seg);
            match cur.entries.entry(seg.to_string()) {
                Entry::Occupied(slot) => match slot.into_mut() {
                    TreeEntry::Dir(dir) => cur = dir,
                    TreeEntry::File(_) => {
                        return Err(VfsError::Conflict(format!(
                            "{} is a file",
                            VfsPath::new(child_parent).join(seg).as_str()
                        )));
                    }
                },
                Entry::Vacant(slot) => {
                    if !auto_create {
                        return Err(VfsError::NotFound(format!(
                            "path {} not found",
                            path.as_str()
                        )));
                    }
                    let node = DirNode::new(child_parent, seg.to_string(), child_abs);
                    match slot.insert(TreeEntry::Dir(node)) {
                        TreeEntry::Dir(dir) => cur = dir,
                        TreeEntry::File(_) => unreachable!("vacant slot filled with a dir"),
                    }
                }
            }
        }
        Ok(cur)
    }
}

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Transfer bookkeeping owned by exactly one `FileRecord` while a chunked
/// upload for that name is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadState {
    /// Hash of the content being transferred.
    pub md5: String,
    /// Declared size of the finished file.
    pub total_size: u64,
    /// Number of chunks the client will send.
    pub chunk_count: u32,
    /// Chunk indices already written to part files.
    pub received: BTreeSet<u32>,
}

impl UploadState {
    pub fn new(md5: impl Into<String>, total_size: u64, chunk_count: u32) -> Self {
        Self {
            md5: md5.into(),
            total_size,
            chunk_count,
            received: BTreeSet::new(),
        }
    }

    pub fn is_received(&self, index: u32) -> bool {
        self.received.contains(&index)
    }

    pub fn mark_received(&mut self, index: u32) {
        self.received.insert(index);
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 >= self.chunk_count
    }
}

/// Outcome of the pre-upload check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckUpload {
    /// Content already resident; the record is complete without a transfer.
    NotNeeded,
    /// Client must upload; `resume` holds the chunk indices already here.
    Needed { resume: BTreeSet<u32> },
}

/// Part file location for one chunk of the file at `abs_path`.
pub fn part_file_path(abs_path: &Path, index: u32) -> PathBuf {
    let mut name = abs_path.as_os_str().to_os_string();
    name.push(format!(".part{}", index));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_state_progress() {
        let mut up = UploadState::new("abcd", 100, 3);
        assert!(!up.is_complete());

        up.mark_received(0);
        up.mark_received(2);
        assert!(up.is_received(0));
        assert!(!up.is_received(1));
        assert!(!up.is_complete());

        // marking twice keeps one entry
        up.mark_received(2);
        assert_eq!(up.received.len(), 2);

        up.mark_received(1);
        assert!(up.is_complete());
    }

    #[test]
    fn test_part_file_path() {
        let part = part_file_path(Path::new("/data/docs/a.txt"), 2);
        assert_eq!(part, PathBuf::from("/data/docs/a.txt.part2"));
    }
}

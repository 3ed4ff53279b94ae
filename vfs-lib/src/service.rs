use crate::config::StoreConfig;
use crate::content_index::ContentIndex;
use crate::tree::{FileRecord, FileTree, TreeEntry};
use crate::upload::{part_file_path, CheckUpload, UploadState};
use crate::{VfsError, VfsPath, VfsResult};
use log::*;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Declared parameters of a pre-upload check.
#[derive(Debug, Clone)]
pub struct CheckUploadReq {
    pub path: String,
    pub filename: String,
    pub md5: String,
    pub total_size: u64,
    pub chunk_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Move,
    Copy,
}

impl FromStr for FileAction {
    type Err = VfsError;

    fn from_str(s: &str) -> VfsResult<Self> {
        match s {
            "move" => Ok(FileAction::Move),
            "copy" => Ok(FileAction::Copy),
            other => Err(VfsError::InvalidParam(format!(
                "unrecognized action: {}",
                other
            ))),
        }
    }
}

/// One listing row. Incomplete uploads never produce a row.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub filename: String,
    pub is_dir: bool,
    pub size: u64,
    pub date: String,
}

/// Where the bytes of a download actually live. Resolved under the shared
/// lock; the caller streams the file after the lock is released.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    pub abs_path: PathBuf,
    pub filename: String,
    pub size: u64,
}

struct StoreState {
    tree: FileTree,
    index: ContentIndex,
}

/// The operation layer over the virtual tree and the content index. All
/// shared state sits behind one process-wide read/write lock: listings and
/// download resolution take it shared, every mutation takes it exclusive
/// for its whole duration, physical I/O included.
pub struct FileStoreService {
    config: StoreConfig,
    state: RwLock<StoreState>,
}

impl FileStoreService {
    pub async fn open(config: StoreConfig) -> VfsResult<Self> {
        fs::create_dir_all(&config.data_dir).await.map_err(|e| {
            warn!(
                "FileStoreService: create data dir {} failed! {}",
                config.data_dir.display(),
                e
            );
            VfsError::IoError(e.to_string())
        })?;
        info!(
            "FileStoreService: opened at {}, save_file_multiple: {}",
            config.data_dir.display(),
            config.save_file_multiple
        );

        let tree = FileTree::new(config.data_dir.clone());
        Ok(Self {
            config,
            state: RwLock::new(StoreState {
                tree,
                index: ContentIndex::new(),
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// List one directory. Files whose upload has not finished are not
    /// visible to clients.
    pub async fn list(&self, path: &str) -> VfsResult<Vec<ListEntry>> {
        debug!("list: {}", path);
        let state = self.state.read().await;
        let dir = state.tree.find_dir(&VfsPath::new(path))?;

        let mut items = Vec::new();
        for (name, entry) in dir.entries.iter() {
            match entry {
                TreeEntry::Dir(_) => items.push(ListEntry {
                    filename: name.clone(),
                    is_dir: true,
                    size: 0,
                    date: String::new(),
                }),
                TreeEntry::File(record) => {
                    if record.file_ok {
                        items.push(ListEntry {
                            filename: name.clone(),
                            is_dir: false,
                            size: record.size,
                            date: record.date.clone(),
                        });
                    }
                }
            }
        }
        Ok(items)
    }

    /// Create a directory chain, idempotently. A path segment already taken
    /// by a file is a conflict.
    pub async fn mkdir(&self, path: &str) -> VfsResult<()> {
        debug!("mkdir: {}", path);
        if path.is_empty() {
            return Err(VfsError::InvalidParam("path is empty".to_string()));
        }

        let mut state = self.state.write().await;
        let dir = state.tree.find_dir_mut(&VfsPath::new(path), true)?;
        fs::create_dir_all(&dir.abs_path).await.map_err(|e| {
            warn!("mkdir: create {} failed! {}", dir.abs_path.display(), e);
            VfsError::IoError(e.to_string())
        })?;
        Ok(())
    }

    /// Remove a file or an empty directory from its parent.
    pub async fn delete(&self, path: &str, filename: &str) -> VfsResult<()> {
        debug!("delete: {} {}", path, filename);
        if filename.is_empty() {
            return Err(VfsError::InvalidParam("filename is empty".to_string()));
        }

        let mut guard = self.state.write().await;
        let StoreState { tree, index } = &mut *guard;
        let dir = tree.find_dir_mut(&VfsPath::new(path), false)?;

        match dir.entries.get_mut(filename) {
            None => {
                return Err(VfsError::NotFound(format!(
                    "{} not found in {}",
                    filename, path
                )));
            }
            Some(TreeEntry::Dir(child)) => {
                if !child.entries.is_empty() {
                    return Err(VfsError::Conflict(format!(
                        "directory {} is not empty",
                        filename
                    )));
                }
            }
            Some(TreeEntry::File(record)) => {
                release_file_record(record, index, self.config.save_file_multiple).await;
            }
        }
        dir.entries.remove(filename);
        Ok(())
    }

    /// The pre-upload decision. Resolves (auto-creating) the destination
    /// directory, then decides between dedup short-circuit, fresh transfer,
    /// resumed transfer, and stale-transfer discard.
    pub async fn check_upload(&self, req: &CheckUploadReq) -> VfsResult<CheckUpload> {
        info!(
            "check_upload: {}/{} md5:{} chunks:{} size:{}",
            req.path, req.filename, req.md5, req.chunk_count, req.total_size
        );
        if req.path.is_empty()
            || req.filename.is_empty()
            || req.md5.is_empty()
            || req.total_size == 0
            || req.chunk_count == 0
        {
            return Err(VfsError::InvalidParam(
                "path, filename, md5, size and chunk count are required".to_string(),
            ));
        }

        let mut guard = self.state.write().await;
        let StoreState { tree, index } = &mut *guard;
        let dir = tree.find_dir_mut(&VfsPath::new(&req.path), true)?;
        let abs_path = dir.abs_path.join(&req.filename);

        // A transfer left fully received by an earlier failed merge is
        // finished (or discarded) before the decision below runs.
        let mut discard_record = false;
        if let Some(TreeEntry::File(record)) = dir.entries.get_mut(&req.filename) {
            let mergeable = record
                .upload
                .as_ref()
                .map_or(false, |up| up.md5 == req.md5 && up.is_complete());
            if mergeable {
                match merge_upload(record, index).await {
                    Ok(_) => {}
                    Err(VfsError::VerifyError(msg)) => {
                        warn!("check_upload: dropping corrupt transfer of {}: {}", req.filename, msg);
                        discard_record = true;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if discard_record {
            dir.entries.remove(&req.filename);
        }

        match dir.entries.get_mut(&req.filename) {
            None => {
                if let Some(entry) = index.lookup(&req.md5) {
                    // content already resident, no transfer needed
                    let known_size = entry.size;
                    let canonical = entry.canonical().to_path_buf();
                    if self.config.save_file_multiple {
                        copy_physical(&canonical, &abs_path).await?;
                        index.register(&req.md5, &abs_path, known_size);
                    }
                    let mut record = FileRecord::new(req.filename.as_str(), abs_path);
                    record.md5 = req.md5.clone();
                    record.size = known_size;
                    record.date = now_format();
                    record.file_ok = true;
                    info!(
                        "check_upload: {} deduplicated against md5 {}",
                        req.filename, req.md5
                    );
                    dir.entries
                        .insert(req.filename.clone(), TreeEntry::File(record));
                    Ok(CheckUpload::NotNeeded)
                } else {
                    let mut record = FileRecord::new(req.filename.as_str(), abs_path);
                    record.md5 = req.md5.clone();
                    record.upload = Some(UploadState::new(
                        req.md5.as_str(),
                        req.total_size,
                        req.chunk_count,
                    ));
                    dir.entries
                        .insert(req.filename.clone(), TreeEntry::File(record));
                    Ok(CheckUpload::Needed {
                        resume: Default::default(),
                    })
                }
            }
            Some(TreeEntry::Dir(_)) => Err(VfsError::Conflict(format!(
                "a directory named {} already exists",
                req.filename
            ))),
            Some(TreeEntry::File(record)) => {
                let fresh = UploadState::new(req.md5.as_str(), req.total_size, req.chunk_count);
                match record.upload.as_ref() {
                    Some(up) if up.md5 == req.md5 => {
                        // a previous transfer of the same content never
                        // finished, hand back the chunks already here
                        Ok(CheckUpload::Needed {
                            resume: up.received.clone(),
                        })
                    }
                    Some(_) => {
                        // in-flight transfer targets different content now
                        clear_upload(record).await;
                        record.upload = Some(fresh);
                        Ok(CheckUpload::Needed {
                            resume: Default::default(),
                        })
                    }
                    None if record.file_ok && record.md5 == req.md5 => {
                        Ok(CheckUpload::NotNeeded)
                    }
                    None => {
                        record.upload = Some(fresh);
                        Ok(CheckUpload::Needed {
                            resume: Default::default(),
                        })
                    }
                }
            }
        }
    }

    /// Accept one chunk of an in-progress transfer and merge the file once
    /// the last chunk lands. Re-sending a received index is a no-op.
    pub async fn ingest_chunk(
        &self,
        path: &str,
        filename: &str,
        md5: &str,
        chunk_index: u32,
        data: &[u8],
    ) -> VfsResult<()> {
        info!(
            "ingest_chunk: {}/{} md5:{} index:{} bytes:{}",
            path,
            filename,
            md5,
            chunk_index,
            data.len()
        );
        if path.is_empty() || filename.is_empty() || md5.is_empty() {
            return Err(VfsError::InvalidParam(
                "path, filename and md5 are required".to_string(),
            ));
        }

        let mut guard = self.state.write().await;
        let StoreState { tree, index } = &mut *guard;
        let dir = tree.find_dir_mut(&VfsPath::new(path), false)?;

        let part_path;
        match dir.entries.get(filename) {
            Some(TreeEntry::File(record)) => {
                let Some(up) = record.upload.as_ref() else {
                    return Err(VfsError::InvalidState(format!(
                        "no transfer in progress for {}, run check first",
                        filename
                    )));
                };
                if up.md5 != md5 {
                    return Err(VfsError::InvalidState(format!(
                        "transfer of {} targets md5 {}, run check first",
                        filename, up.md5
                    )));
                }
                if chunk_index >= up.chunk_count {
                    return Err(VfsError::InvalidParam(format!(
                        "chunk index {} out of range, {} declared",
                        chunk_index, up.chunk_count
                    )));
                }
                if up.is_received(chunk_index) {
                    debug!("ingest_chunk: {} chunk {} already here", filename, chunk_index);
                    return Ok(());
                }
                part_path = part_file_path(&record.abs_path, chunk_index);
            }
            Some(TreeEntry::Dir(_)) | None => {
                return Err(VfsError::InvalidState(format!(
                    "no transfer in progress for {}, run check first",
                    filename
                )));
            }
        }

        // the received set is updated only after the bytes are on disk
        write_part_file(&part_path, data).await?;

        let Some(TreeEntry::File(record)) = dir.entries.get_mut(filename) else {
            return Err(VfsError::Internal(format!("{} vanished mid-ingest", filename)));
        };
        if let Some(up) = record.upload.as_mut() {
            up.mark_received(chunk_index);
        }

        match merge_upload(record, index).await {
            Ok(_) => Ok(()),
            Err(err @ VfsError::VerifyError(_)) => {
                // merged bytes did not match the declaration; the client
                // must restart from a fresh check
                dir.entries.remove(filename);
                Err(err)
            }
            Err(e) => Err(e),
        }
    }

    /// Move or copy a finished file between directories. The destination
    /// chain is auto-created; an unfinished source is rejected.
    pub async fn file_action(
        &self,
        action: FileAction,
        src: &str,
        dest: &str,
        filename: &str,
    ) -> VfsResult<()> {
        info!(
            "file_action: {:?} {} from {} to {}",
            action, filename, src, dest
        );
        if filename.is_empty() {
            return Err(VfsError::InvalidParam("filename is empty".to_string()));
        }

        let mut guard = self.state.write().await;
        let StoreState { tree, index } = &mut *guard;

        let src_dir = tree.find_dir(&VfsPath::new(src))?;
        let src_vpath = src_dir.virtual_path();
        let (src_md5, src_size, src_abs) = match src_dir.entries.get(filename) {
            None => {
                return Err(VfsError::NotFound(format!(
                    "{} not found in {}",
                    filename, src
                )));
            }
            Some(TreeEntry::Dir(_)) => {
                return Err(VfsError::InvalidParam(format!(
                    "{} is a directory",
                    filename
                )));
            }
            Some(TreeEntry::File(record)) => {
                if !record.file_ok {
                    return Err(VfsError::InvalidState(format!(
                        "upload of {} has not finished",
                        filename
                    )));
                }
                (record.md5.clone(), record.size, record.abs_path.clone())
            }
        };

        let dest_dir = tree.find_dir_mut(&VfsPath::new(dest), true)?;
        if dest_dir.virtual_path() == src_vpath {
            debug!("file_action: {} source and destination match", filename);
            return Ok(());
        }
        let dest_abs = dest_dir.abs_path.join(filename);

        match dest_dir.entries.get_mut(filename) {
            Some(TreeEntry::Dir(_)) => {
                return Err(VfsError::Conflict(format!(
                    "a directory named {} already exists in {}",
                    filename, dest
                )));
            }
            Some(TreeEntry::File(old)) => {
                release_file_record(old, index, self.config.save_file_multiple).await;
                dest_dir.entries.remove(filename);
            }
            None => {}
        }

        if self.config.save_file_multiple {
            let Some(entry) = index.lookup(&src_md5) else {
                return Err(VfsError::Internal(format!(
                    "content {} missing from the index",
                    src_md5
                )));
            };
            let canonical = entry.canonical().to_path_buf();
            copy_physical(&canonical, &dest_abs).await?;
            index.register(&src_md5, &dest_abs, src_size);
        }

        let mut record = FileRecord::new(filename, dest_abs);
        record.md5 = src_md5.clone();
        record.size = src_size;
        record.date = now_format();
        record.file_ok = true;
        dest_dir
            .entries
            .insert(filename.to_string(), TreeEntry::File(record));

        if action == FileAction::Move {
            // the destination borrow has ended, the source can be walked again
            let src_dir = tree.find_dir_mut(&VfsPath::new(src), false)?;
            if let Some(TreeEntry::File(old)) = src_dir.entries.get_mut(filename) {
                release_file_record(old, index, self.config.save_file_multiple).await;
            }
            src_dir.entries.remove(filename);
            debug!("file_action: moved {} off {}", filename, src_abs.display());
        }
        Ok(())
    }

    /// Resolve where a download should read from. Under the shared-copy
    /// policy the record's own physical path may never have been
    /// materialized, so reads go to the canonical copy of its hash.
    pub async fn download(&self, path: &str, filename: &str) -> VfsResult<DownloadTarget> {
        debug!("download: {} {}", path, filename);
        let state = self.state.read().await;
        let dir = state.tree.find_dir(&VfsPath::new(path))?;

        match dir.entries.get(filename) {
            None => Err(VfsError::NotFound(format!(
                "{} not found in {}",
                filename, path
            ))),
            Some(TreeEntry::Dir(_)) => Err(VfsError::InvalidParam(format!(
                "{} is a directory",
                filename
            ))),
            Some(TreeEntry::File(record)) => {
                if !record.file_ok {
                    return Err(VfsError::NotFound(format!(
                        "upload of {} has not finished",
                        filename
                    )));
                }
                let abs_path = if self.config.save_file_multiple {
                    record.abs_path.clone()
                } else {
                    let Some(entry) = state.index.lookup(&record.md5) else {
                        return Err(VfsError::NotFound(format!(
                            "content {} missing from the index",
                            record.md5
                        )));
                    };
                    entry.canonical().to_path_buf()
                };
                Ok(DownloadTarget {
                    abs_path,
                    filename: record.name.clone(),
                    size: record.size,
                })
            }
        }
    }
}

fn now_format() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

async fn write_part_file(part_path: &Path, data: &[u8]) -> VfsResult<()> {
    if let Some(parent) = part_path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            warn!("write_part_file: create dir failed! {}", e);
            VfsError::IoError(e.to_string())
        })?;
    }
    let mut file = File::create(part_path).await.map_err(|e| {
        warn!("write_part_file: create {} failed! {}", part_path.display(), e);
        VfsError::IoError(e.to_string())
    })?;
    file.write_all(data).await.map_err(|e| {
        warn!("write_part_file: write {} failed! {}", part_path.display(), e);
        VfsError::IoError(e.to_string())
    })?;
    file.flush().await.map_err(|e| {
        warn!("write_part_file: flush {} failed! {}", part_path.display(), e);
        VfsError::IoError(e.to_string())
    })?;
    Ok(())
}

async fn copy_physical(from: &Path, to: &Path) -> VfsResult<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            warn!("copy_physical: create dir failed! {}", e);
            VfsError::IoError(e.to_string())
        })?;
    }
    fs::copy(from, to).await.map_err(|e| {
        warn!(
            "copy_physical: {} -> {} failed! {}",
            from.display(),
            to.display(),
            e
        );
        VfsError::IoError(e.to_string())
    })
}

async fn remove_physical(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        warn!("remove_physical: {} failed! {}", path.display(), e);
    }
}

/// Drop an in-flight transfer together with its on-disk part files.
async fn clear_upload(record: &mut FileRecord) {
    let Some(up) = record.upload.take() else {
        return;
    };
    debug!(
        "clear_upload: dropping {} received chunk(s) of {}",
        up.received.len(),
        record.name
    );
    for index in up.received.iter() {
        let part = part_file_path(&record.abs_path, *index);
        if let Err(e) = fs::remove_file(&part).await {
            warn!("clear_upload: remove {} failed! {}", part.display(), e);
        }
    }
}

/// Release everything a finished or pending record holds: pending part
/// files always, the physical copy and its index reference only under the
/// per-file-copy policy. The shared canonical copy is retained even when
/// the last virtual file pointing at its hash goes away.
async fn release_file_record(record: &mut FileRecord, index: &mut ContentIndex, save_multiple: bool) {
    clear_upload(record).await;
    if record.file_ok && save_multiple {
        if index.release(&record.md5, &record.abs_path) {
            remove_physical(&record.abs_path).await;
        }
    }
}

/// Concatenate the part files into the final physical file once every
/// declared chunk is here. Both the byte size and the md5 digest of the
/// merged file must match the declaration; a mismatch discards the
/// transfer. An I/O failure puts the upload state back so a later check
/// or chunk can retry the merge.
async fn merge_upload(record: &mut FileRecord, index: &mut ContentIndex) -> VfsResult<bool> {
    let Some(up) = record.upload.take() else {
        return Ok(false);
    };
    if !up.is_complete() {
        record.upload = Some(up);
        return Ok(false);
    }

    if record.file_ok && !record.md5.is_empty() && record.md5 != up.md5 {
        // the final file write below destroys the previous content
        index.release(&record.md5, &record.abs_path);
        record.file_ok = false;
    }

    match write_merged_file(&record.abs_path, &up).await {
        Ok(()) => {}
        Err(err @ VfsError::VerifyError(_)) => {
            warn!(
                "merge_upload: {} failed verification, discarding transfer",
                record.abs_path.display()
            );
            for i in 0..up.chunk_count {
                let part = part_file_path(&record.abs_path, i);
                let _ = fs::remove_file(&part).await;
            }
            remove_physical(&record.abs_path).await;
            return Err(err);
        }
        Err(e) => {
            record.upload = Some(up);
            return Err(e);
        }
    }

    for i in 0..up.chunk_count {
        let part = part_file_path(&record.abs_path, i);
        if let Err(e) = fs::remove_file(&part).await {
            warn!("merge_upload: remove {} failed! {}", part.display(), e);
        }
    }

    record.md5 = up.md5;
    record.size = up.total_size;
    record.date = now_format();
    record.file_ok = true;
    index.register(&record.md5, &record.abs_path, record.size);
    info!(
        "merge_upload: {} complete, {} bytes, md5 {}",
        record.abs_path.display(),
        record.size,
        record.md5
    );
    Ok(true)
}

async fn write_merged_file(abs_path: &Path, up: &UploadState) -> VfsResult<()> {
    if let Some(parent) = abs_path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            warn!("write_merged_file: create dir failed! {}", e);
            VfsError::IoError(e.to_string())
        })?;
    }
    let mut out = File::create(abs_path).await.map_err(|e| {
        warn!("write_merged_file: create {} failed! {}", abs_path.display(), e);
        VfsError::IoError(e.to_string())
    })?;

    let mut written = 0u64;
    let mut context = md5::Context::new();
    for i in 0..up.chunk_count {
        let part = part_file_path(abs_path, i);
        let data = fs::read(&part).await.map_err(|e| {
            warn!("write_merged_file: read {} failed! {}", part.display(), e);
            VfsError::IoError(e.to_string())
        })?;
        context.consume(&data);
        out.write_all(&data).await.map_err(|e| {
            warn!("write_merged_file: write {} failed! {}", abs_path.display(), e);
            VfsError::IoError(e.to_string())
        })?;
        written += data.len() as u64;
    }
    out.flush().await.map_err(|e| {
        warn!("write_merged_file: flush {} failed! {}", abs_path.display(), e);
        VfsError::IoError(e.to_string())
    })?;

    if written != up.total_size {
        return Err(VfsError::VerifyError(format!(
            "merged size {} != declared {}",
            written, up.total_size
        )));
    }
    let digest = format!("{:x}", context.compute());
    if !digest.eq_ignore_ascii_case(&up.md5) {
        return Err(VfsError::VerifyError(format!(
            "merged md5 {} != declared {}",
            digest, up.md5
        )));
    }
    Ok(())
}

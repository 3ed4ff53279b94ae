use futures_util::TryStreamExt;
use log::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::bytes::BufMut;
use tokio_util::io::ReaderStream;
use vfs_lib::{
    CheckUpload, CheckUploadReq, FileAction, FileStoreService, StoreConfig, VfsError, VfsResult,
};
use warp::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use warp::http::{HeaderValue, StatusCode};
use warp::multipart::{FormData, Part};
use warp::{Filter, Reply};

pub const DEFAULT_GATEWAY_CONFIG_PATH: &str = "./file_gateway.json";

/// One chunk plus its form fields must fit in a single multipart body.
const MAX_UPLOAD_FORM_BYTES: u64 = 1024 * 1024 * 1024;
const MAX_CHECK_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct GatewayRunOptions {
    pub config_path: PathBuf,
    pub listen: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub save_multiple: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    #[serde(alias = "listen_addr", alias = "bind")]
    pub listen: String,
    pub store: StoreConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8030".to_string(),
            store: StoreConfig::default(),
        }
    }
}

fn read_json_config<T: DeserializeOwned>(path: &Path) -> VfsResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| VfsError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| VfsError::InvalidParam(format!("parse {} failed: {}", path.display(), e)))
}

pub fn load_gateway_config(path: &Path) -> GatewayConfig {
    match read_json_config::<GatewayConfig>(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("load_gateway_config: {}; using defaults", e);
            GatewayConfig::default()
        }
    }
}

pub fn run_gateway(options: GatewayRunOptions) -> VfsResult<()> {
    let mut config = load_gateway_config(&options.config_path);
    if let Some(listen) = options.listen.as_ref() {
        config.listen = listen.clone();
    }
    if let Some(data_dir) = options.data_dir.as_ref() {
        config.store.data_dir = data_dir.clone();
    }
    if options.save_multiple {
        config.store.save_file_multiple = true;
    }

    let addr: SocketAddr = config.listen.parse().map_err(|e| {
        VfsError::InvalidParam(format!("bad listen address {}: {}", config.listen, e))
    })?;

    let runtime = Runtime::new().map_err(|e| VfsError::Internal(e.to_string()))?;
    runtime.block_on(async {
        let service = Arc::new(FileStoreService::open(config.store).await?);
        info!("file_gateway: serving on http://{}", addr);
        warp::serve(file_routes(service)).run(addr).await;
        Ok(())
    })
}

/// The `/file/*` route set over one shared store service.
pub fn file_routes(
    service: Arc<FileStoreService>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    let with_service = warp::any().map(move || service.clone());

    let list = warp::path!("file" / "list")
        .and(warp::get())
        .and(warp::query::<PathQuery>())
        .and(with_service.clone())
        .and_then(handle_list);

    let delete = warp::path!("file" / "delete")
        .and(warp::post())
        .and(warp::query::<FileQuery>())
        .and(with_service.clone())
        .and_then(handle_delete);

    let mkdir = warp::path!("file" / "mkdir")
        .and(warp::post())
        .and(warp::query::<PathQuery>())
        .and(with_service.clone())
        .and_then(handle_mkdir);

    let check = warp::path!("file" / "check")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_CHECK_BODY_BYTES))
        .and(warp::body::json())
        .and(with_service.clone())
        .and_then(handle_check);

    let upload = warp::path!("file" / "upload")
        .and(warp::post())
        .and(warp::multipart::form().max_length(MAX_UPLOAD_FORM_BYTES))
        .and(with_service.clone())
        .and_then(handle_upload);

    let download = warp::path!("file" / "download")
        .and(warp::get())
        .and(warp::query::<FileQuery>())
        .and(with_service.clone())
        .and_then(handle_download);

    let action = warp::path!("file" / "action")
        .and(warp::post())
        .and(warp::query::<ActionQuery>())
        .and(with_service)
        .and_then(handle_action);

    list.or(delete)
        .or(mkdir)
        .or(check)
        .or(upload)
        .or(download)
        .or(action)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PathQuery {
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileQuery {
    path: String,
    filename: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ActionQuery {
    action: String,
    filename: String,
    src: String,
    dest: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileCheckReq {
    path: String,
    filename: String,
    md5: String,
    /// Number of chunks the client will send.
    total: u32,
    size: u64,
}

#[derive(Debug, Serialize)]
struct ResultCode {
    ok: bool,
    message: String,
}

impl ResultCode {
    fn from_result(result: VfsResult<()>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                message: String::new(),
            },
            Err(e) => Self {
                ok: false,
                message: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ListItem {
    filename: String,
    is_dir: bool,
    size: u64,
    date: String,
}

#[derive(Debug, Serialize)]
struct FileListResp {
    ok: bool,
    total: usize,
    count: usize,
    items: Option<BTreeMap<String, ListItem>>,
    disk_used: u64,
    disk_total: u64,
    disk_used_p: f64,
    #[serde(rename = "pathSeparator")]
    path_separator: String,
}

#[derive(Debug, Serialize)]
struct FileCheckResp {
    ok: bool,
    message: String,
    need: bool,
    upload: Option<BTreeMap<String, String>>,
}

async fn handle_list(
    q: PathQuery,
    service: Arc<FileStoreService>,
) -> Result<impl Reply, Infallible> {
    let resp = match service.list(&q.path).await {
        Ok(entries) => {
            let items: BTreeMap<String, ListItem> = entries
                .into_iter()
                .map(|e| {
                    (
                        e.filename.clone(),
                        ListItem {
                            filename: e.filename,
                            is_dir: e.is_dir,
                            size: e.size,
                            date: e.date,
                        },
                    )
                })
                .collect();
            let (disk_total, disk_used, disk_used_p) = disk_usage(service.data_dir());
            FileListResp {
                ok: true,
                total: items.len(),
                count: items.len(),
                items: Some(items),
                disk_used,
                disk_total,
                disk_used_p,
                path_separator: std::path::MAIN_SEPARATOR.to_string(),
            }
        }
        Err(e) => {
            debug!("list {} rejected: {}", q.path, e);
            FileListResp {
                ok: false,
                total: 0,
                count: 0,
                items: None,
                disk_used: 0,
                disk_total: 0,
                disk_used_p: 0.0,
                path_separator: String::new(),
            }
        }
    };
    Ok(warp::reply::json(&resp))
}

async fn handle_delete(
    q: FileQuery,
    service: Arc<FileStoreService>,
) -> Result<impl Reply, Infallible> {
    let result = service.delete(&q.path, &q.filename).await;
    Ok(warp::reply::json(&ResultCode::from_result(result)))
}

async fn handle_mkdir(
    q: PathQuery,
    service: Arc<FileStoreService>,
) -> Result<impl Reply, Infallible> {
    let result = service.mkdir(&q.path).await;
    Ok(warp::reply::json(&ResultCode::from_result(result)))
}

async fn handle_check(
    req: FileCheckReq,
    service: Arc<FileStoreService>,
) -> Result<impl Reply, Infallible> {
    let check = CheckUploadReq {
        path: req.path,
        filename: req.filename,
        md5: req.md5,
        total_size: req.size,
        chunk_count: req.total,
    };
    let resp = match service.check_upload(&check).await {
        Ok(CheckUpload::NotNeeded) => FileCheckResp {
            ok: true,
            message: String::new(),
            need: false,
            upload: None,
        },
        Ok(CheckUpload::Needed { resume }) => {
            let upload = if resume.is_empty() {
                None
            } else {
                Some(
                    resume
                        .iter()
                        .map(|index| (index.to_string(), String::new()))
                        .collect(),
                )
            };
            FileCheckResp {
                ok: true,
                message: String::new(),
                need: true,
                upload,
            }
        }
        Err(e) => FileCheckResp {
            ok: false,
            message: e.to_string(),
            need: false,
            upload: None,
        },
    };
    Ok(warp::reply::json(&resp))
}

async fn handle_upload(
    form: FormData,
    service: Arc<FileStoreService>,
) -> Result<impl Reply, Infallible> {
    let result = ingest_multipart(form, service).await;
    Ok(warp::reply::json(&ResultCode::from_result(result)))
}

async fn ingest_multipart(form: FormData, service: Arc<FileStoreService>) -> VfsResult<()> {
    let parts: Vec<Part> = form.try_collect().await.map_err(|e| {
        warn!("upload: read multipart form failed! {}", e);
        VfsError::InvalidParam(format!("bad multipart body: {}", e))
    })?;

    let mut path = String::new();
    let mut filename = String::new();
    let mut md5 = String::new();
    let mut current: Option<u32> = None;
    let mut chunk: Option<Vec<u8>> = None;

    for part in parts {
        let field = part.name().to_string();
        let data = read_part(part).await?;
        match field.as_str() {
            "path" => path = text_field(&field, data)?,
            "filename" => filename = text_field(&field, data)?,
            "md5" => md5 = text_field(&field, data)?,
            "current" => {
                let text = text_field(&field, data)?;
                let index = text.parse::<u32>().map_err(|_| {
                    VfsError::InvalidParam(format!("bad chunk index: {}", text))
                })?;
                current = Some(index);
            }
            "file" => chunk = Some(data),
            other => debug!("upload: ignoring form field {}", other),
        }
    }

    let Some(current) = current else {
        return Err(VfsError::InvalidParam("current field is required".to_string()));
    };
    let Some(chunk) = chunk else {
        return Err(VfsError::InvalidParam("file field is required".to_string()));
    };
    service
        .ingest_chunk(&path, &filename, &md5, current, &chunk)
        .await
}

async fn read_part(part: Part) -> VfsResult<Vec<u8>> {
    let field = part.name().to_string();
    part.stream()
        .try_fold(Vec::new(), |mut buf, data| {
            buf.put(data);
            async move { Ok(buf) }
        })
        .await
        .map_err(|e| {
            warn!("upload: read form field {} failed! {}", field, e);
            VfsError::InvalidParam(format!("read form field {} failed: {}", field, e))
        })
}

fn text_field(field: &str, data: Vec<u8>) -> VfsResult<String> {
    String::from_utf8(data)
        .map_err(|_| VfsError::InvalidParam(format!("field {} is not utf-8", field)))
}

async fn handle_download(
    q: FileQuery,
    service: Arc<FileStoreService>,
) -> Result<warp::reply::Response, Infallible> {
    match download_response(&q, service).await {
        Ok(resp) => Ok(resp),
        Err(e) => {
            debug!("download {}/{} rejected: {}", q.path, q.filename, e);
            Ok(warp::reply::with_status("Bad request", StatusCode::BAD_REQUEST).into_response())
        }
    }
}

async fn download_response(
    q: &FileQuery,
    service: Arc<FileStoreService>,
) -> VfsResult<warp::reply::Response> {
    let target = service.download(&q.path, &q.filename).await?;
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        target.filename
    ))
    .map_err(|_| {
        VfsError::InvalidParam(format!("filename {} is not header-safe", target.filename))
    })?;

    // the tree lock is already released; the transfer runs outside it
    let file = tokio::fs::File::open(&target.abs_path).await.map_err(|e| {
        warn!("download: open {} failed! {}", target.abs_path.display(), e);
        VfsError::IoError(e.to_string())
    })?;
    let stream = ReaderStream::new(file);
    let mut resp = warp::reply::stream(stream).into_response();
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    resp.headers_mut().insert(CONTENT_DISPOSITION, disposition);
    Ok(resp)
}

async fn handle_action(
    q: ActionQuery,
    service: Arc<FileStoreService>,
) -> Result<impl Reply, Infallible> {
    let result = match q.action.parse::<FileAction>() {
        Ok(action) => service.file_action(action, &q.src, &q.dest, &q.filename).await,
        Err(e) => Err(e),
    };
    Ok(warp::reply::json(&ResultCode::from_result(result)))
}

fn disk_usage(data_dir: &Path) -> (u64, u64, f64) {
    let total = fs2::total_space(data_dir).unwrap_or_else(|e| {
        warn!("disk_usage: total_space of {} failed! {}", data_dir.display(), e);
        0
    });
    let available = fs2::available_space(data_dir).unwrap_or_else(|e| {
        warn!("disk_usage: available_space of {} failed! {}", data_dir.display(), e);
        0
    });
    let used = total.saturating_sub(available);
    let used_p = if total > 0 {
        used as f64 * 100.0 / total as f64
    } else {
        0.0
    };
    (total, used, used_p)
}

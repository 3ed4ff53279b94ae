use crate::gateway::{file_routes, load_gateway_config};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Once;
use tempfile::TempDir;
use vfs_lib::{FileStoreService, StoreConfig};

static INIT_LOGGER: Once = Once::new();

fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

async fn create_service(save_file_multiple: bool) -> (TempDir, Arc<FileStoreService>) {
    init_logging();
    let temp_dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        data_dir: temp_dir.path().join("data"),
        save_file_multiple,
    };
    let service = FileStoreService::open(config).await.unwrap();
    (temp_dir, Arc::new(service))
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

const BOUNDARY: &str = "----file-gateway-test";

fn multipart_body(fields: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        if *name == "file" {
            body.extend_from_slice(
                b"Content-Disposition: form-data; name=\"file\"; filename=\"chunk\"\r\n",
            );
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        } else {
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
            );
        }
        body.extend_from_slice(value);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn post_check(service: &Arc<FileStoreService>, body: &Value) -> Value {
    let routes = file_routes(service.clone());
    let res = warp::test::request()
        .method("POST")
        .path("/file/check")
        .json(body)
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    serde_json::from_slice(res.body()).unwrap()
}

async fn post_chunk(
    service: &Arc<FileStoreService>,
    path: &str,
    filename: &str,
    md5: &str,
    index: u32,
    data: &[u8],
) -> Value {
    let routes = file_routes(service.clone());
    let body = multipart_body(&[
        ("path", path.as_bytes().to_vec()),
        ("filename", filename.as_bytes().to_vec()),
        ("md5", md5.as_bytes().to_vec()),
        ("current", index.to_string().into_bytes()),
        ("file", data.to_vec()),
    ]);
    let res = warp::test::request()
        .method("POST")
        .path("/file/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(body)
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    serde_json::from_slice(res.body()).unwrap()
}

async fn get_list(service: &Arc<FileStoreService>, path: &str) -> Value {
    let routes = file_routes(service.clone());
    let res = warp::test::request()
        .method("GET")
        .path(&format!("/file/list?path={}", path))
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    serde_json::from_slice(res.body()).unwrap()
}

#[tokio::test]
async fn test_check_upload_list_download_cycle() {
    let (_temp_dir, service) = create_service(false).await;
    let chunks = [vec![b'h'; 64], vec![b'i'; 36]];
    let whole = chunks.concat();
    let md5 = md5_hex(&whole);

    let check = post_check(
        &service,
        &json!({
            "path": "/docs",
            "filename": "a.txt",
            "md5": md5,
            "total": 2,
            "size": whole.len(),
        }),
    )
    .await;
    assert_eq!(check["ok"], json!(true));
    assert_eq!(check["need"], json!(true));
    assert_eq!(check["upload"], Value::Null);

    for (index, data) in chunks.iter().enumerate() {
        let reply = post_chunk(&service, "/docs", "a.txt", &md5, index as u32, data).await;
        assert_eq!(reply["ok"], json!(true));
        assert_eq!(reply["message"], json!(""));
    }

    let list = get_list(&service, "/docs").await;
    assert_eq!(list["ok"], json!(true));
    assert_eq!(list["count"], json!(1));
    assert_eq!(list["items"]["a.txt"]["is_dir"], json!(false));
    assert_eq!(list["items"]["a.txt"]["size"], json!(100));
    assert!(list["disk_total"].as_u64().unwrap() > 0);
    assert_eq!(list["pathSeparator"], json!("/"));

    // the content is resident now, so the same declaration needs no upload
    let check = post_check(
        &service,
        &json!({
            "path": "/docs",
            "filename": "a.txt",
            "md5": md5,
            "total": 2,
            "size": whole.len(),
        }),
    )
    .await;
    assert_eq!(check["ok"], json!(true));
    assert_eq!(check["need"], json!(false));

    let routes = file_routes(service.clone());
    let res = warp::test::request()
        .method("GET")
        .path("/file/download?path=/docs&filename=a.txt")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.body().as_ref(), whole.as_slice());
    assert_eq!(
        res.headers()
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap(),
        "attachment; filename=\"a.txt\""
    );
    assert_eq!(
        res.headers().get("content-type").unwrap().to_str().unwrap(),
        "application/octet-stream"
    );
}

#[tokio::test]
async fn test_check_reports_resume_chunks() {
    let (_temp_dir, service) = create_service(false).await;
    let chunks = [vec![b'r'; 40], vec![b's'; 40]];
    let md5 = md5_hex(&chunks.concat());
    let declaration = json!({
        "path": "/resume",
        "filename": "f.bin",
        "md5": md5,
        "total": 2,
        "size": 80,
    });

    let check = post_check(&service, &declaration).await;
    assert_eq!(check["need"], json!(true));
    post_chunk(&service, "/resume", "f.bin", &md5, 0, &chunks[0]).await;

    // interrupted transfer: the second check hands back the received set
    let check = post_check(&service, &declaration).await;
    assert_eq!(check["ok"], json!(true));
    assert_eq!(check["need"], json!(true));
    assert_eq!(check["upload"], json!({ "0": "" }));

    // incomplete files stay invisible
    let list = get_list(&service, "/resume").await;
    assert_eq!(list["count"], json!(0));
}

#[tokio::test]
async fn test_action_copy_move_and_unknown() {
    let (_temp_dir, service) = create_service(false).await;
    let data = vec![b'd'; 48];
    let md5 = md5_hex(&data);
    post_check(
        &service,
        &json!({
            "path": "/src",
            "filename": "doc.pdf",
            "md5": md5,
            "total": 1,
            "size": 48,
        }),
    )
    .await;
    post_chunk(&service, "/src", "doc.pdf", &md5, 0, &data).await;

    let routes = file_routes(service.clone());
    let res = warp::test::request()
        .method("POST")
        .path("/file/action?action=copy&filename=doc.pdf&src=/src&dest=/copies")
        .reply(&routes)
        .await;
    let reply: Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(reply["ok"], json!(true));
    assert_eq!(get_list(&service, "/copies").await["count"], json!(1));
    assert_eq!(get_list(&service, "/src").await["count"], json!(1));

    let res = warp::test::request()
        .method("POST")
        .path("/file/action?action=move&filename=doc.pdf&src=/src&dest=/moved")
        .reply(&routes)
        .await;
    let reply: Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(reply["ok"], json!(true));
    assert_eq!(get_list(&service, "/src").await["count"], json!(0));
    assert_eq!(get_list(&service, "/moved").await["count"], json!(1));

    // unrecognized action values mutate nothing
    let res = warp::test::request()
        .method("POST")
        .path("/file/action?action=rename&filename=doc.pdf&src=/moved&dest=/gone")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    let reply: Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(reply["ok"], json!(false));
    assert!(reply["message"].as_str().unwrap().contains("rename"));
    assert_eq!(get_list(&service, "/moved").await["count"], json!(1));
}

#[tokio::test]
async fn test_mkdir_delete_and_error_envelopes() {
    let (_temp_dir, service) = create_service(false).await;
    let routes = file_routes(service.clone());

    let res = warp::test::request()
        .method("POST")
        .path("/file/mkdir?path=/a/b")
        .reply(&routes)
        .await;
    let reply: Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(reply["ok"], json!(true));
    assert_eq!(reply["message"], json!(""));

    let list = get_list(&service, "/a").await;
    assert_eq!(list["items"]["b"]["is_dir"], json!(true));

    // application failures keep HTTP 200 and report through the envelope
    let res = warp::test::request()
        .method("POST")
        .path("/file/delete?path=/a&filename=nope")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    let reply: Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(reply["ok"], json!(false));
    assert!(!reply["message"].as_str().unwrap().is_empty());

    // a missing filename parameter is an envelope failure, not a rejection
    let res = warp::test::request()
        .method("POST")
        .path("/file/delete?path=/a")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    let reply: Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(reply["ok"], json!(false));

    let res = warp::test::request()
        .method("POST")
        .path("/file/delete?path=/a&filename=b")
        .reply(&routes)
        .await;
    let reply: Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(reply["ok"], json!(true));

    // a check that targets an existing directory name is a conflict
    let res = warp::test::request()
        .method("POST")
        .path("/file/mkdir?path=/a/sub")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 200);
    let check = post_check(
        &service,
        &json!({
            "path": "/a",
            "filename": "sub",
            "md5": "ffeeddccbbaa",
            "total": 1,
            "size": 10,
        }),
    )
    .await;
    assert_eq!(check["ok"], json!(false));
    assert_eq!(check["need"], json!(false));

    // listing an unresolved path answers the list envelope with ok:false
    let list = get_list(&service, "/no/such/dir").await;
    assert_eq!(list["ok"], json!(false));
    assert_eq!(list["items"], Value::Null);
}

#[tokio::test]
async fn test_download_failure_is_bad_request() {
    let (_temp_dir, service) = create_service(false).await;
    let routes = file_routes(service.clone());

    let res = warp::test::request()
        .method("GET")
        .path("/file/download?path=/missing&filename=f.bin")
        .reply(&routes)
        .await;
    assert_eq!(res.status(), 400);
    assert_eq!(res.body().as_ref(), b"Bad request");
}

#[test]
fn test_gateway_config_loading() {
    init_logging();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("file_gateway.json");
    std::fs::write(
        &config_path,
        serde_json::to_string_pretty(&json!({
            "listen": "127.0.0.1:9099",
            "store": {
                "root_dir": "/tmp/gateway-data",
                "save_multiple": true
            }
        }))
        .unwrap(),
    )
    .unwrap();

    let config = load_gateway_config(&config_path);
    assert_eq!(config.listen, "127.0.0.1:9099");
    assert_eq!(config.store.data_dir, PathBuf::from("/tmp/gateway-data"));
    assert!(config.store.save_file_multiple);

    // a missing file falls back to defaults
    let config = load_gateway_config(&temp_dir.path().join("absent.json"));
    assert_eq!(config.listen, "127.0.0.1:8030");
    assert!(!config.store.save_file_multiple);
}

use crate::fat::{format_volume, FatVolume, FormatOptions};
use crate::MemoryBlockDevice;

use super::*;

fn volume(memory: &mut [u8]) -> FatVolume<MemoryBlockDevice<'_>> {
    let mut bd = MemoryBlockDevice::new(memory);
    format_volume(&mut bd, &FormatOptions::default()).unwrap();
    let mut volume = FatVolume::new(bd).unwrap();
    volume.create_directory("/docs").unwrap();
    volume.write_file("/docs/notes.txt", b"some notes").unwrap();
    volume.write_file("/hello.txt", b"Hello, World").unwrap();
    volume
}

fn server(download: bool, upload: bool, deletion: bool) -> FileServer {
    FileServer::new(FileServerConfig {
        enable_download: download,
        enable_upload: upload,
        enable_deletion: deletion,
        ..Default::default()
    })
    .unwrap()
}

fn download<S: Storage>(response: Response<'_, S>) -> Vec<u8> {
    match response.body {
        Body::Download(mut download) => download.read_to_end().unwrap(),
        Body::Text(text) => panic!("not a download: {}", text),
    }
}

#[test]
fn requests() {
    let request = Request::get("/file/docs/a%20b.txt?index=0&last#top").with_header("accept", "application/json");
    assert_eq!(request.path(), "/file/docs/a%20b.txt");
    assert_eq!(request.query("index"), Some("0"));
    assert_eq!(request.query("last"), Some(""));
    assert_eq!(request.query("name"), None);
    assert_eq!(request.header("Accept"), Some("application/json"));
    assert!(request.accepts_json());
    assert_eq!(Method::from_name("DELETE"), Some(Method::Delete));
    assert_eq!(Method::from_name("BREW"), None);
}

#[test]
fn prefix_matching() {
    let server = server(false, false, false);
    assert!(server.can_handle("/file"));
    assert!(server.can_handle("/file/"));
    assert!(server.can_handle("/file/docs?x=1"));
    assert!(!server.can_handle("/files"));
    assert!(!server.can_handle("/"));
    assert!(!server.can_handle("/other/file"));
}

#[test]
fn listing_is_always_allowed() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);
    let server = server(false, false, false);

    let response = server.handle(&mut storage, &Request::get("/file"));
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "text/html");
    let html = response.body_text().unwrap();
    assert!(html.contains("<a href=\"/file/docs\">docs</a>"));
    assert!(html.contains("<td>hello.txt</td>"));

    let response = server.handle(
        &mut storage,
        &Request::get("/file/docs/").with_header("Accept", "application/json, text/plain"),
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "application/json");
    let json = response.body_text().unwrap();
    assert!(json.starts_with("{\"folder\":\"/docs\""));
    assert!(json.contains("\"url\":\"/file/docs/notes.txt\""));
    assert!(json.contains("\"size\":10"));
}

#[test]
fn downloads() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);

    let response = server(false, false, false).handle(&mut storage, &Request::get("/file/hello.txt"));
    assert_eq!(response.status, 403);

    let server = server(true, false, false);
    let response = server.handle(&mut storage, &Request::get("/file/hello.txt"));
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "text/plain");
    assert_eq!(
        response.header("Content-Disposition"),
        Some("attachment; filename=\"hello.txt\"")
    );
    assert_eq!(response.header("content-length"), Some("12"));
    assert_eq!(download(response), b"Hello, World");

    let response = server.handle(&mut storage, &Request::get("/file/missing.txt"));
    assert_eq!(response.status, 404);
}

#[test]
fn downloads_come_in_chunks() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);
    let contents: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
    storage.write_file("/big.bin", &contents).unwrap();

    let server = server(true, false, false);
    let response = server.handle(&mut storage, &Request::get("/file/big.bin"));
    assert_eq!(response.content_type, "application/octet-stream");
    let mut download = match response.body {
        Body::Download(download) => download,
        Body::Text(_) => panic!("expected a download"),
    };
    assert_eq!(download.size(), 2500);

    let mut buffer = [0u8; 4096];
    let mut sizes = Vec::new();
    let mut received = Vec::new();
    loop {
        let read = download.next_chunk(&mut buffer).unwrap();
        if read == 0 {
            break;
        }
        sizes.push(read);
        received.extend_from_slice(&buffer[..read]);
    }
    assert_eq!(sizes, [1024, 1024, 452]);
    assert_eq!(received, contents);
    assert_eq!(download.remaining(), 0);
}

#[test]
fn escaping_the_root_is_forbidden() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);
    let server = FileServer::new(FileServerConfig {
        root_path: String::from("/docs"),
        enable_download: true,
        enable_deletion: true,
        ..Default::default()
    })
    .unwrap();

    let response = server.handle(&mut storage, &Request::get("/file/../hello.txt"));
    assert_eq!(response.status, 403);
    let response = server.handle(&mut storage, &Request::get("/file/%2E%2E/hello.txt"));
    assert_eq!(response.status, 403);
    let response = server.handle(&mut storage, &Request::delete("/file/sub/../../hello.txt"));
    assert_eq!(response.status, 403);
    assert!(storage.is_directory("/docs"));
    assert_eq!(storage.file_size("/hello.txt").unwrap(), 12);

    // Inside the root is fine
    let response = server.handle(&mut storage, &Request::get("/file/notes.txt"));
    assert_eq!(response.status, 200);
    assert_eq!(download(response), b"some notes");

    let response = server.handle(&mut storage, &Request::get("/file/bad%zz"));
    assert_eq!(response.status, 400);
}

#[test]
fn uploads() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);

    let response = server(false, false, false).handle(&mut storage, &Request::post("/file/new.txt", b"x"));
    assert_eq!(response.status, 403);
    assert!(storage.stat("/new.txt").is_err());

    let server = server(false, true, false);
    let response = server.handle(&mut storage, &Request::post("/file/new.txt", b"first"));
    assert_eq!(response.status, 200);
    let response = server.handle(&mut storage, &Request::post("/file/new.txt", b"second"));
    assert_eq!(response.status, 200);
    assert_eq!(storage.read_file("/new.txt").unwrap(), b"second");

    let response = server.handle(&mut storage, &Request::post("/file/docs?name=up.txt", b"into a folder"));
    assert_eq!(response.status, 200);
    assert_eq!(storage.read_file("/docs/up.txt").unwrap(), b"into a folder");

    let response = server.handle(&mut storage, &Request::post("/file/docs", b"nameless"));
    assert_eq!(response.status, 400);
    let response = server.handle(&mut storage, &Request::post("/file/docs?name=..", b"x"));
    assert_eq!(response.status, 400);
    let response = server.handle(&mut storage, &Request::post("/file/bad%20name.txt", b"x"));
    assert_eq!(response.status, 400);
    let response = server.handle(&mut storage, &Request::post("/file/nowhere/x.txt", b"x"));
    assert_eq!(response.status, 404);
}

#[test]
fn chunked_uploads() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);
    let server = server(false, true, false);

    let response = server.handle(&mut storage, &Request::post("/file/log.txt?index=0", b"abc"));
    assert_eq!((response.status, response.body_text()), (200, Some("Chunk stored")));
    let response = server.handle(&mut storage, &Request::post("/file/log.txt?index=3", b"def"));
    assert_eq!(response.status, 200);
    let response = server.handle(&mut storage, &Request::post("/file/log.txt?index=6&last=true", b"g"));
    assert_eq!((response.status, response.body_text()), (200, Some("File uploaded")));
    assert_eq!(storage.read_file("/log.txt").unwrap(), b"abcdefg");

    // Starting over truncates
    server.handle(&mut storage, &Request::post("/file/log.txt?index=0", b"xy"));
    assert_eq!(storage.read_file("/log.txt").unwrap(), b"xy");

    // A chunk at the wrong offset abandons the upload
    let response = server.handle(&mut storage, &Request::post("/file/log.txt?index=5", b"z"));
    assert_eq!(response.status, 400);
    assert_eq!(Storage::stat(&mut storage, "/log.txt"), Err(StorageError::NotFound));

    let response = server.handle(&mut storage, &Request::post("/file/log.txt?index=x", b"z"));
    assert_eq!(response.status, 400);
}

#[test]
fn deletion() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);

    let response = server(true, true, false).handle(&mut storage, &Request::delete("/file/hello.txt"));
    assert_eq!(response.status, 403);
    assert!(storage.stat("/hello.txt").is_ok());

    let server = server(false, false, true);
    let response = server.handle(&mut storage, &Request::delete("/file/docs"));
    assert_eq!(response.status, 409);
    let response = server.handle(&mut storage, &Request::delete("/file/docs/notes.txt"));
    assert_eq!(response.status, 200);
    let response = server.handle(&mut storage, &Request::delete("/file/docs"));
    assert_eq!(response.status, 200);
    assert_eq!(Storage::stat(&mut storage, "/docs"), Err(StorageError::NotFound));
    let response = server.handle(&mut storage, &Request::delete("/file/docs"));
    assert_eq!(response.status, 404);
    let response = server.handle(&mut storage, &Request::delete("/file/"));
    assert_eq!(response.status, 403);
}

#[test]
fn other_methods() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);
    let server = server(true, true, true);
    let response = server.handle(&mut storage, &Request::new(Method::Put, "/file/hello.txt"));
    assert_eq!(response.status, 405);
    assert_eq!(response.reason(), "Method Not Allowed");
    assert_eq!(response.header("Allow"), Some("GET, POST, DELETE"));

    let response = server.handle(&mut storage, &Request::get("/elsewhere"));
    assert_eq!(response.status, 404);
}

#[test]
fn status_mapping() {
    assert_eq!(status_for(StorageError::NotFound), 404);
    assert_eq!(status_for(StorageError::NotEmpty), 409);
    assert_eq!(status_for(StorageError::IsADirectory), 409);
    assert_eq!(status_for(StorageError::InvalidName), 400);
    assert_eq!(status_for(StorageError::NoSpace), 507);
    assert_eq!(status_for(StorageError::Unavailable), 503);
    assert_eq!(status_for(StorageError::Busy), 503);
    assert_eq!(status_for(StorageError::Io), 500);
    let response = Response::<()>::from(StorageError::NoSpace);
    assert_eq!(response.body_text(), Some("no space left"));
    assert_eq!(response.reason(), "Insufficient Storage");
}

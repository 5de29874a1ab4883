//! The file server and the actions sharing one card.

mod common;

use std::cell::RefCell;

use common::*;

use sdmmc_storage::action::{ActionData, ActionRegistry, DataValue, Templatable};
use sdmmc_storage::fat::{format_volume, FormatOptions};
use sdmmc_storage::sdmmc::Initialized;
use sdmmc_storage::{
    Body, FileServer, FileServerConfig, MemoryBlockDevice, NoPowerControl, Request, SdCard, SdMmcNative,
    Storage, StorageError,
};

fn mounted_card() -> SdCard<SdMmcNative<FakeHost, Initialized>, NoPowerControl> {
    init_logging();
    let mut host = FakeHost::new(CardKind::Sdhc);
    let mut bd = MemoryBlockDevice::new(&mut host.memory);
    format_volume(&mut bd, &FormatOptions::default()).unwrap();
    SdCard::setup_native(host, None::<NoPowerControl>, native_bus(false))
}

fn open_server() -> FileServer {
    FileServer::new(FileServerConfig {
        url_prefix: String::from("/sd/"),
        root_path: String::from("/www"),
        enable_deletion: true,
        enable_download: true,
        enable_upload: true,
    })
    .unwrap()
}

#[test]
fn actions_and_requests_share_the_card() {
    let card = RefCell::new(mounted_card());
    let mut storage = &card;
    let server = open_server();
    assert_eq!(server.config().url_prefix, "sd");
    assert!(server.can_handle("/sd/index.html"));

    let registry = ActionRegistry::new();
    registry
        .build::<()>("sd_mmc_card.create_directory", Templatable::from(String::from("/www")), None)
        .unwrap()
        .play(&mut storage, &())
        .unwrap();
    registry
        .build::<()>(
            "storage.write_file",
            Templatable::from(String::from("/www/index.htm")),
            Some(ActionData::Raw(DataValue::Text(String::from("<h1>hi</h1>")))),
        )
        .unwrap()
        .play(&mut storage, &())
        .unwrap();

    let response = server.handle(&mut storage, &Request::get("/sd/index.htm"));
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "application/octet-stream");
    let mut download = match response.body {
        Body::Download(download) => download,
        Body::Text(text) => panic!("expected a download, got {}", text),
    };
    assert_eq!(download.read_to_end().unwrap(), b"<h1>hi</h1>");

    let response = server.handle(&mut storage, &Request::post("/sd/?name=up.txt", b"uploaded"));
    assert_eq!(response.status, 200);
    assert_eq!(card.borrow_mut().read_file("/www/up.txt").unwrap(), b"uploaded");

    let response = server.handle(
        &mut storage,
        &Request::get("/sd").with_header("Accept", "application/json"),
    );
    assert_eq!(response.status, 200);
    let json = response.body_text().unwrap();
    assert!(json.contains("\"url\":\"/sd/index.htm\""));
    assert!(json.contains("\"url\":\"/sd/up.txt\""));

    let response = server.handle(&mut storage, &Request::delete("/sd/up.txt"));
    assert_eq!(response.status, 200);
    assert_eq!(
        card.borrow_mut().stat("/www/up.txt"),
        Err(StorageError::NotFound)
    );
}

#[test]
fn uploads_wait_for_a_running_download() {
    let card = RefCell::new(mounted_card());
    let server = open_server();
    let original = vec![b'A'; 3000];
    card.borrow_mut().create_directory("/www").unwrap();
    card.borrow_mut().write_file("/www/data.txt", &original).unwrap();

    let mut shared = &card;
    {
        let mut claimed = card.borrow_mut();
        let response = server.handle(&mut *claimed, &Request::get("/sd/data.txt"));
        assert_eq!(response.status, 200);
        let mut download = match response.body {
            Body::Download(download) => download,
            Body::Text(text) => panic!("expected a download, got {}", text),
        };
        let mut buffer = [0u8; 1024];
        assert_eq!(download.next_chunk(&mut buffer).unwrap(), 1024);
        let mut received = buffer.to_vec();

        // The card is taken until the download is done
        let response = server.handle(&mut shared, &Request::post("/sd/data.txt", &[b'B'; 3000]));
        assert_eq!((response.status, response.body_text()), (503, Some("storage busy")));
        let response = server.handle(&mut shared, &Request::delete("/sd/data.txt"));
        assert_eq!(response.status, 503);
        assert_eq!(shared.stat("/www/data.txt"), Err(StorageError::Busy));

        received.extend(download.read_to_end().unwrap());
        assert_eq!(received, original);
    }

    let response = server.handle(&mut shared, &Request::post("/sd/data.txt", &[b'B'; 3000]));
    assert_eq!(response.status, 200);
    assert_eq!(card.borrow_mut().read_file("/www/data.txt").unwrap(), vec![b'B'; 3000]);
}

#[test]
fn action_with_a_lambda() {
    let card = RefCell::new(mounted_card());
    let mut storage = &card;
    let registry = ActionRegistry::new();

    let append = registry
        .build::<u32>(
            "sd_mmc_card.append_file",
            Templatable::lambda(|day: &u32| format!("/day{}.log", day)),
            Some(ActionData::Lambda(Box::new(|day: &u32| format!("entry {}\n", day).into_bytes()))),
        )
        .unwrap();
    let create = registry
        .build::<u32>(
            "sd_mmc_card.write_file",
            Templatable::lambda(|day: &u32| format!("/day{}.log", day)),
            Some(ActionData::Raw(DataValue::List(vec![]))),
        )
        .unwrap();

    create.play(&mut storage, &3).unwrap();
    append.play(&mut storage, &3).unwrap();
    append.play(&mut storage, &3).unwrap();
    assert_eq!(card.borrow_mut().read_file("/day3.log").unwrap(), b"entry 3\nentry 3\n");

    // Appending to a missing file creates it
    append.play(&mut storage, &4).unwrap();
    assert_eq!(card.borrow_mut().read_file("/day4.log").unwrap(), b"entry 4\n");
}

#[test]
fn failures_stay_with_the_request() {
    let card = RefCell::new(mounted_card());
    let mut storage = &card;
    let registry = ActionRegistry::new();

    let remove = registry
        .build::<()>("sd_mmc_card.remove_directory", Templatable::from(String::from("/none")), None)
        .unwrap();
    assert_eq!(remove.play(&mut storage, &()), Err(StorageError::NotFound));

    // The card keeps working for everyone else
    let server = FileServer::new(FileServerConfig::default()).unwrap();
    let response = server.handle(&mut storage, &Request::get("/file/"));
    assert_eq!(response.status, 200);
    let response = server.handle(&mut storage, &Request::delete("/file/x.txt"));
    assert_eq!(response.status, 403);
}

#[test]
fn unavailable_card() {
    let mut host = FakeHost::new(CardKind::Sdhc);
    host.present = false;
    let card = RefCell::new(SdCard::setup_native(host, None::<NoPowerControl>, native_bus(false)));
    let mut storage = &card;

    let server = open_server();
    let response = server.handle(&mut storage, &Request::get("/sd/"));
    assert_eq!(response.status, 503);
    assert_eq!(response.reason(), "Service Unavailable");

    let action = ActionRegistry::new()
        .build::<()>("storage.delete_file", Templatable::from(String::from("/a.txt")), None)
        .unwrap();
    assert_eq!(action.play(&mut storage, &()), Err(StorageError::Unavailable));
}

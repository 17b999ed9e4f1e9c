//! End-to-end flows that cross module boundaries: certificate exchange
//! between two group members, and a full sender-to-receiver chunk pipe.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;

use lanwarp::transfer::writer::LandingArea;
use lanwarp::transfer::{ChunkIterator, SendFileOperation};
use lanwarp::{Authenticator, EventBus, FsCredentialStore, OpStatus, TransferSelection};

fn authenticator(dir: &Path, group_code: &str, hostname: &str) -> Authenticator {
    let store = FsCredentialStore::new(dir.to_path_buf()).unwrap();
    Authenticator::new(
        Box::new(store),
        group_code,
        hostname.to_string(),
        "127.0.0.1".parse().unwrap(),
    )
}

#[test]
fn group_members_can_exchange_certificates() {
    let alice_dir = tempdir().unwrap();
    let bob_dir = tempdir().unwrap();
    let alice = authenticator(alice_dir.path(), "our secret", "alice");
    let bob = authenticator(bob_dir.path(), "our secret", "bob");

    let cert = alice.credentials().unwrap().cert_pem;
    let blob = alice.box_certificate(cert.as_bytes()).unwrap();
    let unboxed = bob.unbox_certificate(&blob).unwrap();
    assert_eq!(unboxed, cert.as_bytes());
}

#[test]
fn outsiders_cannot_read_the_boxed_certificate() {
    let alice_dir = tempdir().unwrap();
    let eve_dir = tempdir().unwrap();
    let alice = authenticator(alice_dir.path(), "our secret", "alice");
    let eve = authenticator(eve_dir.path(), "guessed wrong", "eve");

    let cert = alice.credentials().unwrap().cert_pem;
    let blob = alice.box_certificate(cert.as_bytes()).unwrap();
    assert!(eve.unbox_certificate(&blob).is_err());
}

#[test]
fn folder_survives_the_chunk_pipe_intact() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();

    let root = src.path().join("album");
    fs::create_dir_all(root.join("raw")).unwrap();
    fs::write(root.join("cover.jpg"), vec![0xAAu8; 3000]).unwrap();
    fs::write(root.join("raw/shot1.raw"), vec![0xBBu8; 5000]).unwrap();
    fs::write(root.join("raw/shot2.raw"), b"").unwrap();

    let selection = TransferSelection::from_path(&root).unwrap();
    let mut landing = LandingArea::new();
    let mut written = 0u64;
    for chunk in ChunkIterator::with_chunk_size(&[selection], 1024) {
        written += landing.apply(&chunk.unwrap(), dst.path(), false).unwrap();
    }
    landing.finish().unwrap();

    assert_eq!(written, 8000);
    assert_eq!(
        fs::read(dst.path().join("album/cover.jpg")).unwrap(),
        vec![0xAAu8; 3000]
    );
    assert_eq!(
        fs::read(dst.path().join("album/raw/shot1.raw")).unwrap(),
        vec![0xBBu8; 5000]
    );
    assert_eq!(
        fs::read(dst.path().join("album/raw/shot2.raw")).unwrap(),
        b""
    );
}

#[test]
fn name_collisions_rename_without_touching_the_original() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();

    fs::write(src.path().join("notes.txt"), b"incoming").unwrap();
    fs::write(dst.path().join("notes.txt"), b"precious").unwrap();

    let selection = TransferSelection::from_path(src.path().join("notes.txt")).unwrap();
    let mut landing = LandingArea::new();
    for chunk in ChunkIterator::new(&[selection]) {
        landing.apply(&chunk.unwrap(), dst.path(), false).unwrap();
    }
    landing.finish().unwrap();

    assert_eq!(fs::read(dst.path().join("notes.txt")).unwrap(), b"precious");
    assert_eq!(fs::read(dst.path().join("notes1.txt")).unwrap(), b"incoming");
}

#[tokio::test]
async fn send_stream_feeds_a_receiver_to_completion() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    fs::write(src.path().join("payload.bin"), vec![7u8; 4096]).unwrap();

    let op = Arc::new(
        SendFileOperation::new(
            "PEER".into(),
            vec![TransferSelection::from_path(src.path().join("payload.bin")).unwrap()],
            EventBus::default(),
        )
        .unwrap(),
    );

    let mut rx = op.clone().open_stream(1000);
    let mut landing = LandingArea::new();
    let mut received = 0u64;
    while let Some(chunk) = rx.recv().await {
        received += landing
            .apply(&chunk.unwrap(), dst.path(), false)
            .unwrap();
    }
    landing.finish().unwrap();

    assert_eq!(received, 4096);
    assert_eq!(op.status(), OpStatus::Finished);
    assert_eq!(
        fs::read(dst.path().join("payload.bin")).unwrap(),
        vec![7u8; 4096]
    );
}

//! Uploader behavior over a scripted transport: interruption and resume,
//! transient retries and progress reporting.

mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};

use common::{download_config, plaintext, upload_config, Fault, ScriptedTransport};
use kegs_core::types::{FileSubject, TransferDirection};
use kegs_core::KegError;
use kegs_crypto::{generate_key, SymmetricKey, CHUNK_OVERHEAD};
use kegs_sync::memory::MemoryStore;
use kegs_sync::resume::ResumeStore;
use kegs_sync::stream::{MemorySink, MemorySource};
use kegs_sync::{Downloader, Uploader};

const CHUNK: u64 = 32;
const STORED: u64 = CHUNK + CHUNK_OVERHEAD as u64;

fn src() -> &'static Path {
    Path::new("/tmp/kegs-upload-test")
}

fn uploader(transport: &Arc<ScriptedTransport>, plain: &[u8], key: &SymmetricKey, resume: &ResumeStore) -> Uploader {
    let subject = FileSubject::for_plaintext("up", plain.len() as u64, CHUNK, CHUNK_OVERHEAD as u64);
    Uploader::new(
        transport.clone(),
        subject,
        key.clone(),
        src(),
        Box::new(MemorySource::new(plain.to_vec())),
        upload_config(1),
    )
    .expect("uploader")
    .with_resume_store(resume.clone())
}

/// Download the stored blob and return its plaintext.
async fn read_back(store: Arc<MemoryStore>, len: usize, key: &SymmetricKey) -> Vec<u8> {
    let subject = FileSubject::for_plaintext("up", len as u64, CHUNK, CHUNK_OVERHEAD as u64);
    let (sink, handle) = MemorySink::new();
    Downloader::new(
        store,
        subject,
        key.clone(),
        Path::new("/tmp/kegs-read-back"),
        Box::new(sink),
        download_config(2, 4 * STORED, 4 * STORED),
    )
    .expect("downloader")
    .start()
    .wait()
    .await
    .expect("read back");
    handle.bytes()
}

#[tokio::test]
async fn test_disconnect_then_resume_sends_only_remaining_chunks() {
    let plain = plaintext(10 * CHUNK as usize);
    let key = generate_key();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::new(Arc::clone(&store)));
    let resume = ResumeStore::in_memory();

    transport.cut_uploads_at(Some(3 * STORED));
    let err = uploader(&transport, &plain, &key, &resume)
        .start()
        .wait()
        .await
        .expect_err("upload interrupted");
    assert!(matches!(err, KegError::Disconnected));

    let descriptor = resume
        .get(TransferDirection::Upload, "up")
        .expect("resume lookup")
        .expect("descriptor kept after failure");
    assert_eq!(descriptor.whole_chunks_completed, 3);
    let first_run = transport.uploads().len();

    transport.cut_uploads_at(None);
    uploader(&transport, &plain, &key, &resume)
        .resume_from(&descriptor)
        .start()
        .wait()
        .await
        .expect("resumed upload");

    let resumed: Vec<u64> = transport.uploads()[first_run..]
        .iter()
        .map(|(offset, _)| *offset)
        .collect();
    let expected: Vec<u64> = (3..10).map(|i| i * STORED).collect();
    assert_eq!(resumed, expected);

    assert!(resume
        .get(TransferDirection::Upload, "up")
        .expect("resume lookup")
        .is_none());
    assert_eq!(read_back(store, plain.len(), &key).await, plain);
}

#[tokio::test]
async fn test_transient_failure_resends_identical_ciphertext() {
    let plain = plaintext(3 * CHUNK as usize + 5);
    let key = generate_key();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::new(Arc::clone(&store)));
    transport.push_upload_fault(Fault::Transport);

    uploader(&transport, &plain, &key, &ResumeStore::in_memory())
        .start()
        .wait()
        .await
        .expect("upload");

    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 5);
    assert_eq!(uploads[0].0, 0);
    assert_eq!(uploads[1].0, 0);
    assert_eq!(uploads[0].1, uploads[1].1);
    assert_eq!(read_back(store, plain.len(), &key).await, plain);
}

#[tokio::test]
async fn test_progress_reaches_total() {
    let plain = plaintext(7 * CHUNK as usize + 1);
    let key = generate_key();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::new(store));
    let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);

    uploader(&transport, &plain, &key, &ResumeStore::in_memory())
        .on_progress(Box::new(move |done: u64, total: u64, _file: &str| {
            record.lock().unwrap().push((done, total));
        }))
        .start()
        .wait()
        .await
        .expect("upload");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 8);
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    let (done, total) = *seen.last().expect("at least one report");
    assert_eq!(done, total);
    assert_eq!(total, plain.len() as u64 + 8 * CHUNK_OVERHEAD as u64);
}

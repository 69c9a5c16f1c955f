//! Transfer sessions over in-memory TLS channels.

mod common;

use std::path::Path;

use indicatif::ProgressBar;
use tokio::io::DuplexStream;

use securexfer::protocol::{Receipt, TransferDigest, MAX_FRAME_LEN, MAX_METADATA_LEN};
use securexfer::{
    Error, SecuredChannel, SessionOptions, TransferMetadata, TransferReport, TransferSession,
};

use common::{connected_pair, TestPki};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn write_source(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

async fn transfer(
    source: &Path,
    storage: &Path,
    sender_options: SessionOptions,
) -> (
    securexfer::Result<TransferReport>,
    securexfer::Result<TransferReport>,
) {
    let pki = TestPki::new();
    let (mut server, mut client) = connected_pair(&pki).await;
    let progress = ProgressBar::hidden();
    let receiver_options = SessionOptions::default();

    tokio::join!(
        TransferSession::receive(&mut server, storage, &receiver_options),
        TransferSession::send(&mut client, source, &sender_options, &progress),
    )
}

/// Send raw frames as a misbehaving sender would.
async fn send_frames(channel: &mut SecuredChannel<DuplexStream>, frames: &[&[u8]]) {
    for frame in frames {
        channel.send_frame(frame).await.unwrap();
    }
    channel.flush().await.unwrap();
}

fn digest_of(data: &[u8]) -> [u8; 32] {
    let mut digest = TransferDigest::new();
    digest.update(data);
    digest.finalize()
}

#[tokio::test]
async fn test_round_trip_150000_bytes() {
    let src = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    let contents = pattern(150_000);
    let source = write_source(src.path(), "payload.bin", &contents);

    let (received, sent) = transfer(&source, storage.path(), SessionOptions::default()).await;
    let received = received.unwrap();
    let sent = sent.unwrap();

    assert_eq!(received.bytes, 150_000);
    assert_eq!(received.digest, sent.digest);
    assert_eq!(received.digest, hex::encode(digest_of(&contents)));
    assert_eq!(sent.destination, None);

    let stored = storage.path().join("payload.bin");
    assert_eq!(received.destination.as_deref(), Some(stored.as_path()));
    assert_eq!(std::fs::read(&stored).unwrap(), contents);
    assert!(!storage.path().join("payload.bin.part").exists());
}

#[tokio::test]
async fn test_empty_file_round_trip() {
    let src = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    let source = write_source(src.path(), "empty.txt", b"");

    let (received, sent) = transfer(&source, storage.path(), SessionOptions::default()).await;
    let received = received.unwrap();
    sent.unwrap();

    assert_eq!(received.bytes, 0);
    assert_eq!(
        received.digest,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(
        std::fs::read(storage.path().join("empty.txt")).unwrap(),
        Vec::<u8>::new()
    );
}

#[tokio::test]
async fn test_chunk_size_does_not_change_the_result() {
    let contents = pattern(1000);

    for chunk_size in [1, 7, 1000, 4096] {
        let src = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let source = write_source(src.path(), "chunked.dat", &contents);
        let options = SessionOptions {
            chunk_size,
            ..SessionOptions::default()
        };

        let (received, sent) = transfer(&source, storage.path(), options).await;
        assert_eq!(received.unwrap().digest, sent.unwrap().digest);
        assert_eq!(
            std::fs::read(storage.path().join("chunked.dat")).unwrap(),
            contents,
            "chunk size {}",
            chunk_size
        );
    }
}

#[tokio::test]
async fn test_frame_layout_on_the_wire() {
    let pki = TestPki::new();
    let (mut server, mut client) = connected_pair(&pki).await;
    let src = tempfile::tempdir().unwrap();
    let contents = pattern(150_000);
    let source = write_source(src.path(), "layout.bin", &contents);
    let options = SessionOptions {
        chunk_size: 65_536,
        ..SessionOptions::default()
    };
    let progress = ProgressBar::hidden();

    let observe = async {
        let metadata = server.recv_frame(MAX_METADATA_LEN).await.unwrap();
        let metadata = TransferMetadata::decode(&metadata).unwrap();
        assert_eq!(metadata, TransferMetadata::new("layout.bin", 150_000));

        let mut data_frames = Vec::new();
        let mut received = Vec::new();
        while (received.len() as u64) < metadata.size {
            let frame = server.recv_frame(MAX_FRAME_LEN).await.unwrap();
            data_frames.push(frame.len());
            received.extend_from_slice(&frame);
        }
        let trailer = server.recv_frame(32).await.unwrap();

        server.send_frame(&[Receipt::Accepted.to_byte()]).await.unwrap();
        server.flush().await.unwrap();
        (data_frames, received, trailer)
    };

    let (observed, sent) = tokio::join!(
        observe,
        TransferSession::send(&mut client, &source, &options, &progress)
    );
    let (data_frames, received, trailer) = observed;

    assert_eq!(data_frames, vec![65_536, 65_536, 18_928]);
    assert_eq!(received, contents);
    assert_eq!(trailer, digest_of(&contents).to_vec());
    assert_eq!(sent.unwrap().bytes, 150_000);
}

#[tokio::test]
async fn test_truncated_transfer_keeps_partial_file() {
    let pki = TestPki::new();
    let (mut server, mut client) = connected_pair(&pki).await;
    let storage = tempfile::tempdir().unwrap();
    let metadata = TransferMetadata::new("cut.bin", 1000).encode().unwrap();
    let partial = pattern(400);

    let sender = async {
        send_frames(&mut client, &[&metadata, &partial]).await;
        client.close().await.unwrap();
    };
    let defaults = SessionOptions::default();
    let (result, ()) = tokio::join!(
        TransferSession::receive(&mut server, storage.path(), &defaults),
        sender
    );

    match result.unwrap_err() {
        Error::TransferAborted {
            received, declared, ..
        } => {
            assert_eq!(received, 400);
            assert_eq!(declared, 1000);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(!storage.path().join("cut.bin").exists());
    assert_eq!(
        std::fs::read(storage.path().join("cut.bin.part")).unwrap(),
        partial
    );
}

#[tokio::test]
async fn test_digest_mismatch_marks_file_corrupt() {
    let pki = TestPki::new();
    let (mut server, mut client) = connected_pair(&pki).await;
    let storage = tempfile::tempdir().unwrap();
    let contents = pattern(5000);
    let metadata = TransferMetadata::new("flipped.bin", 5000).encode().unwrap();

    let mut tampered = contents.clone();
    tampered[2500] ^= 0x01;
    let wrong_trailer = digest_of(&tampered);

    let sender = async {
        send_frames(&mut client, &[&metadata, &contents, &wrong_trailer]).await;
        Receipt::decode(&client.recv_frame(1).await.unwrap()).unwrap()
    };
    let defaults = SessionOptions::default();
    let (result, receipt) = tokio::join!(
        TransferSession::receive(&mut server, storage.path(), &defaults),
        sender
    );

    assert!(matches!(result, Err(Error::Integrity { .. })));
    assert_eq!(receipt, Receipt::IntegrityFailed);
    assert!(!storage.path().join("flipped.bin").exists());
    assert!(!storage.path().join("flipped.bin.part").exists());
    assert_eq!(
        std::fs::read(storage.path().join("flipped.bin.corrupt")).unwrap(),
        contents
    );
}

#[tokio::test]
async fn test_unsafe_names_rejected_before_any_file_is_created() {
    for name in ["../escape.txt", "/etc/passwd", "a/../../b", "C:\\evil"] {
        let pki = TestPki::new();
        let (mut server, mut client) = connected_pair(&pki).await;
        let root = tempfile::tempdir().unwrap();
        let storage = root.path().join("storage");
        std::fs::create_dir(&storage).unwrap();
        let metadata = TransferMetadata::new(name, 3).encode().unwrap();

        let sender = async {
            send_frames(&mut client, &[&metadata]).await;
            Receipt::decode(&client.recv_frame(1).await.unwrap()).unwrap()
        };
        let defaults = SessionOptions::default();
        let (result, receipt) = tokio::join!(
            TransferSession::receive(&mut server, &storage, &defaults),
            sender
        );

        assert!(
            matches!(result, Err(Error::UnsafeFilename { .. })),
            "{name} was not rejected"
        );
        assert_eq!(receipt, Receipt::Rejected);
        assert_eq!(std::fs::read_dir(&storage).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
    }
}

#[tokio::test]
async fn test_oversized_declaration_is_rejected() {
    let pki = TestPki::new();
    let (mut server, mut client) = connected_pair(&pki).await;
    let src = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    let source = write_source(src.path(), "big.bin", &pattern(100));
    let receiver_options = SessionOptions {
        max_file_size: 10,
        ..SessionOptions::default()
    };
    let progress = ProgressBar::hidden();

    let defaults = SessionOptions::default();
    let (received, sent) = tokio::join!(
        TransferSession::receive(&mut server, storage.path(), &receiver_options),
        TransferSession::send(&mut client, &source, &defaults, &progress),
    );

    match received.unwrap_err() {
        Error::FileTooLarge { declared, limit } => {
            assert_eq!(declared, 100);
            assert_eq!(limit, 10);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(sent, Err(Error::Rejected(_))));
    assert_eq!(std::fs::read_dir(storage.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_overrunning_data_frame_aborts() {
    let pki = TestPki::new();
    let (mut server, mut client) = connected_pair(&pki).await;
    let storage = tempfile::tempdir().unwrap();
    let metadata = TransferMetadata::new("short.bin", 10).encode().unwrap();
    let too_much = pattern(11);

    let frames: [&[u8]; 2] = [&metadata, &too_much];
    let sender = send_frames(&mut client, &frames);
    let defaults = SessionOptions::default();
    let (result, ()) = tokio::join!(
        TransferSession::receive(&mut server, storage.path(), &defaults),
        sender
    );

    assert!(matches!(result, Err(Error::TransferAborted { .. })));
    assert!(!storage.path().join("short.bin").exists());
}

#[tokio::test]
async fn test_nested_name_lands_in_subdirectory() {
    let pki = TestPki::new();
    let (mut server, mut client) = connected_pair(&pki).await;
    let storage = tempfile::tempdir().unwrap();
    let contents = b"nested".to_vec();
    let metadata = TransferMetadata::new("reports/2024/q1.txt", contents.len() as u64)
        .encode()
        .unwrap();
    let trailer = digest_of(&contents);

    let sender = async {
        send_frames(&mut client, &[&metadata, &contents, &trailer]).await;
        Receipt::decode(&client.recv_frame(1).await.unwrap()).unwrap()
    };
    let defaults = SessionOptions::default();
    let (result, receipt) = tokio::join!(
        TransferSession::receive(&mut server, storage.path(), &defaults),
        sender
    );

    result.unwrap();
    assert_eq!(receipt, Receipt::Accepted);
    assert_eq!(
        std::fs::read(storage.path().join("reports").join("2024").join("q1.txt")).unwrap(),
        contents
    );
}

/// Drain frames until the sender hangs up, returning their lengths.
async fn frames_until_closed(channel: &mut SecuredChannel<DuplexStream>) -> Vec<usize> {
    let mut lengths = Vec::new();
    while let Ok(frame) = channel.recv_frame(MAX_FRAME_LEN).await {
        lengths.push(frame.len());
    }
    lengths
}

#[tokio::test]
async fn test_source_shorter_than_declared_sends_no_trailer() {
    let pki = TestPki::new();
    let (mut server, mut client) = connected_pair(&pki).await;
    let shrunk = pattern(600);
    let options = SessionOptions {
        chunk_size: 256,
        ..SessionOptions::default()
    };
    let progress = ProgressBar::hidden();

    let sender = async {
        let result = TransferSession::send_stream(
            &mut client,
            "shrunk.log".to_string(),
            1000,
            &shrunk[..],
            &options,
            &progress,
        )
        .await;
        client.close().await.unwrap();
        result
    };
    let (sent, frames) = tokio::join!(sender, frames_until_closed(&mut server));

    match sent.unwrap_err() {
        Error::SourceSizeMismatch { declared, actual } => {
            assert_eq!(declared, 1000);
            assert_eq!(actual, 600);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // Metadata, then the two full chunks read before the source ran dry.
    assert_eq!(frames[1..], [256, 256]);
}

#[tokio::test]
async fn test_source_longer_than_declared_sends_no_trailer() {
    let pki = TestPki::new();
    let (mut server, mut client) = connected_pair(&pki).await;
    let grown = pattern(1200);
    let defaults = SessionOptions::default();
    let progress = ProgressBar::hidden();

    let sender = async {
        let result = TransferSession::send_stream(
            &mut client,
            "grown.log".to_string(),
            1000,
            &grown[..],
            &defaults,
            &progress,
        )
        .await;
        client.close().await.unwrap();
        result
    };
    let (sent, frames) = tokio::join!(sender, frames_until_closed(&mut server));

    match sent.unwrap_err() {
        Error::SourceSizeMismatch { declared, actual } => {
            assert_eq!(declared, 1000);
            assert_eq!(actual, 1200);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(frames[1..], [1000]);
}

#[tokio::test]
async fn test_silent_sender_times_out_and_keeps_partial_file() {
    use std::sync::Arc;
    use std::time::Duration;

    use securexfer::{ChannelConfig, SecureChannelFactory, VerifyMode};

    let pki = TestPki::new();
    let impatient = ChannelConfig::builder(VerifyMode::None)
        .io_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let server_factory =
        SecureChannelFactory::server(Arc::new(impatient), &pki.leaf("localhost")).unwrap();
    let (server, client) = common::handshake(&server_factory, &common::verifying_client(&pki)).await;
    let (mut server, mut client) = (server.unwrap(), client.unwrap());

    let storage = tempfile::tempdir().unwrap();
    let metadata = TransferMetadata::new("x", 10).encode().unwrap();
    let first = pattern(4);
    let frames: [&[u8]; 2] = [&metadata, &first];
    let defaults = SessionOptions::default();

    let (result, ()) = tokio::join!(
        TransferSession::receive(&mut server, storage.path(), &defaults),
        send_frames(&mut client, &frames)
    );

    let err = result.unwrap_err();
    assert!(matches!(err, Error::Timeout("read")), "got {err:?}");
    assert_eq!(err.exit_code(), 8);
    assert_eq!(
        std::fs::read(storage.path().join("x.part")).unwrap(),
        first
    );
    drop(client);
}

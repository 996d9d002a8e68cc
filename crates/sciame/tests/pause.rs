mod common;

use std::sync::Arc;

use common::*;
use sciame::{
    error::Error,
    storage::MemoryStorage,
    swarm::PeerSource,
    torrent::{ResumeTo, TorrentStatus},
    wire::BLOCK_LEN,
};

// Three peers that never answer keep 15 requests in flight. Pausing
// returns them all, resuming requests the same pieces again.
#[tokio::test]
async fn pause_returns_requests_and_resume_restores_them() {
    init_tracing();

    let piece_length = 2 * BLOCK_LEN;
    let data = random_data(16 * piece_length as usize);
    let descriptor = descriptor(&data, piece_length);

    let mut peers = Vec::new();
    for _ in 0..3 {
        peers.push(MockPeer::spawn(&descriptor, data.clone(), Mode::Stall).await);
    }

    let config = config();
    let pipeline = config.pipeline_depth;
    let (handle, _) = start(config).await;

    // the first piece is already on disk
    let storage = Arc::new(MemoryStorage::with_data(
        &descriptor,
        data[..piece_length as usize].to_vec(),
    ));
    let info_hash = handle
        .add_torrent(
            descriptor,
            storage,
            PeerSource::from_addrs(peers.iter().map(|p| p.addr)),
        )
        .await
        .unwrap();

    let before = wait_state(&handle, &info_hash, 10, |s| {
        s.connected_peers == 3 && s.outstanding_requests == 3 * pipeline
    })
    .await;
    assert_eq!(before.status, TorrentStatus::Downloading);
    assert_eq!(before.verified_pieces, 1);
    assert_eq!(before.in_progress, (1..=8).collect::<Vec<_>>());

    let status = handle.pause(&info_hash).await.unwrap();
    assert_eq!(status, TorrentStatus::Paused(ResumeTo::Downloading));

    // pausing twice is not an error
    let status = handle.pause(&info_hash).await.unwrap();
    assert_eq!(status, TorrentStatus::Paused(ResumeTo::Downloading));

    let paused = wait_state(&handle, &info_hash, 2, |s| {
        s.outstanding_requests == 0
    })
    .await;
    assert_eq!(paused.connected_peers, 3);
    assert_eq!(paused.verified_pieces, 1);

    let status = handle.resume(&info_hash).await.unwrap();
    assert_eq!(status, TorrentStatus::Downloading);

    let after = wait_state(&handle, &info_hash, 10, |s| {
        s.outstanding_requests == 3 * pipeline
    })
    .await;
    assert_eq!(after.status, TorrentStatus::Downloading);
    assert_eq!(after.in_progress, before.in_progress);
    assert_eq!(after.verified_pieces, 1);

    // the verified piece was never requested
    for peer in &peers {
        assert!(peer.requested().iter().all(|b| b.index != 0));
    }

    assert!(matches!(
        handle.resume(&info_hash).await,
        Err(Error::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn paused_torrent_does_not_connect() {
    init_tracing();

    let data = random_data(2 * BLOCK_LEN as usize);
    let descriptor = descriptor(&data, BLOCK_LEN);
    let seeder = MockPeer::spawn(&descriptor, data.clone(), Mode::Honest).await;

    let (handle, _) = start(config()).await;

    let (candidates, rx) = futures::channel::mpsc::unbounded();
    let storage = Arc::new(MemoryStorage::new(&descriptor));
    let info_hash = handle
        .add_torrent(descriptor, storage.clone(), PeerSource::new(rx))
        .await
        .unwrap();

    wait_state(&handle, &info_hash, 10, |s| {
        s.status == TorrentStatus::Downloading
    })
    .await;
    handle.pause(&info_hash).await.unwrap();

    candidates.unbounded_send(seeder.addr).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(seeder.connections(), 0);

    handle.resume(&info_hash).await.unwrap();
    wait_state(&handle, &info_hash, 10, |s| s.status == TorrentStatus::Seeding)
        .await;
    assert_eq!(storage.snapshot().await, data);
}

mod common;

use std::{sync::Arc, time::Duration};

use common::*;
use sciame::{
    error::{Error, ErrorKind},
    storage::MemoryStorage,
    supervisor::{Supervisor, SupervisorEvent},
    swarm::PeerSource,
    torrent::{InfoHash, TorrentStatus},
    wire::BLOCK_LEN,
};
use tokio::time::timeout;

#[tokio::test]
async fn invalid_descriptor_is_rejected() {
    init_tracing();

    let data = random_data(2 * BLOCK_LEN as usize);
    let mut descriptor = descriptor(&data, BLOCK_LEN);
    descriptor.piece_hashes.pop();
    let info_hash = descriptor.info_hash.clone();

    let (handle, _) = start(config()).await;
    let storage = Arc::new(MemoryStorage::new(&descriptor));

    let r = handle.add_torrent(descriptor, storage, PeerSource::empty()).await;
    assert!(matches!(r, Err(Error::DescriptorInvalid(_))));
    assert_eq!(handle.torrent_state(&info_hash).await.unwrap(), None);
    assert!(handle.torrent_states().await.is_empty());
}

#[tokio::test]
async fn duplicate_and_limit() {
    init_tracing();

    let mut config = config();
    config.max_torrents = 2;
    let (handle, _) = start(config).await;

    let data = random_data(BLOCK_LEN as usize);
    let first = descriptor(&data, BLOCK_LEN);
    let storage = Arc::new(MemoryStorage::new(&first));

    handle
        .add_torrent(first.clone(), storage.clone(), PeerSource::empty())
        .await
        .unwrap();

    let r = handle
        .add_torrent(first.clone(), storage.clone(), PeerSource::empty())
        .await;
    assert!(matches!(r, Err(Error::NoDuplicateTorrent)));

    let second = descriptor(&data, BLOCK_LEN);
    handle
        .add_torrent(second, storage.clone(), PeerSource::empty())
        .await
        .unwrap();

    let third = descriptor(&data, BLOCK_LEN);
    let r = handle.add_torrent(third, storage.clone(), PeerSource::empty()).await;
    assert!(matches!(r, Err(Error::TooManyTorrents(2))));

    // removing frees a slot
    handle.remove(&first.info_hash).await.unwrap();
    let third = descriptor(&data, BLOCK_LEN);
    handle.add_torrent(third, storage, PeerSource::empty()).await.unwrap();
}

#[tokio::test]
async fn commands_for_unknown_torrents() {
    init_tracing();

    let (handle, _) = start(config()).await;
    let info_hash = InfoHash::random();

    assert!(matches!(
        handle.pause(&info_hash).await,
        Err(Error::TorrentDoesNotExist)
    ));
    assert!(matches!(
        handle.resume(&info_hash).await,
        Err(Error::TorrentDoesNotExist)
    ));
    assert!(matches!(
        handle.stop(&info_hash).await,
        Err(Error::TorrentDoesNotExist)
    ));
    assert!(matches!(
        handle.remove(&info_hash).await,
        Err(Error::TorrentDoesNotExist)
    ));
    assert_eq!(handle.torrent_state(&info_hash).await.unwrap(), None);
}

#[tokio::test]
async fn add_and_remove_events() {
    init_tracing();

    let (handle, _) = start(config()).await;
    let mut events = handle.subscribe();

    let data = random_data(BLOCK_LEN as usize);
    let descriptor = descriptor(&data, BLOCK_LEN);
    let storage = Arc::new(MemoryStorage::new(&descriptor));

    let info_hash = handle
        .add_torrent(descriptor, storage, PeerSource::empty())
        .await
        .unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        SupervisorEvent::TorrentAdded(info_hash.clone())
    );

    // published by the torrent every second
    timeout(Duration::from_secs(3), async {
        loop {
            let states = handle.torrent_states().await;
            if states.iter().any(|s| s.status == TorrentStatus::Downloading) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    handle.remove(&info_hash).await.unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        SupervisorEvent::TorrentRemoved(info_hash.clone())
    );
    assert_eq!(handle.torrent_state(&info_hash).await.unwrap(), None);
}

#[tokio::test]
async fn storage_failure_moves_the_torrent_to_error() {
    init_tracing();

    let data = random_data(2 * BLOCK_LEN as usize);
    let descriptor = descriptor(&data, BLOCK_LEN);
    let seeder = MockPeer::spawn(&descriptor, data.clone(), Mode::Honest).await;

    let (handle, _) = start(config()).await;
    let mut events = handle.subscribe();

    let storage = Arc::new(MemoryStorage::new(&descriptor));
    storage.fail_writes(true);

    let info_hash = handle
        .add_torrent(descriptor, storage, PeerSource::from_addrs([seeder.addr]))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(10), async {
        loop {
            if let SupervisorEvent::TorrentError { info_hash, kind, .. } =
                events.recv().await.unwrap()
            {
                break (info_hash, kind);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, (info_hash.clone(), ErrorKind::Storage));

    let state = wait_state(&handle, &info_hash, 5, |s| {
        s.status == TorrentStatus::Error
    })
    .await;
    assert!(state.error.is_some());
    assert_eq!(state.connected_peers, 0);
    assert_eq!(state.outstanding_requests, 0);

    // the error state is final
    assert!(matches!(
        handle.resume(&info_hash).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        handle.stop(&info_hash).await,
        Err(Error::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let mut config = config();
    config.pipeline_depth = 0;
    assert!(matches!(
        Supervisor::new(config).await,
        Err(Error::ConfigError(_))
    ));
}

#[tokio::test]
async fn quit_stops_every_torrent() {
    init_tracing();

    let (handle, _) = start(config()).await;
    let data = random_data(BLOCK_LEN as usize);
    let descriptor = descriptor(&data, BLOCK_LEN);
    let storage = Arc::new(MemoryStorage::new(&descriptor));

    handle
        .add_torrent(descriptor, storage, PeerSource::empty())
        .await
        .unwrap();
    handle.quit().await.unwrap();

    // the supervisor loop is gone, commands fail
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.pause(&InfoHash::random()).await.is_err());
}

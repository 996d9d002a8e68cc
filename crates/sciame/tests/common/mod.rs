#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rand::{distributions::Alphanumeric, Rng};
use sciame::{
    bitfield::{Bitfield, BitfieldExt},
    config::Config,
    descriptor::{FileEntry, TorrentDescriptor},
    peer::PeerId,
    supervisor::{Supervisor, SupervisorHandle},
    torrent::{InfoHash, TorrentState},
    wire::{Block, BlockInfo, Handshake, HandshakeCodec, Message, MessageCodec},
};
use sha1_smol::Sha1;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    spawn,
    time::{sleep, timeout, Instant},
};
use tokio_util::codec::{Framed, FramedParts};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .compact()
        .with_file(false)
        .without_time()
        .with_test_writer()
        .try_init();
}

/// Short timeouts so failures show up quickly.
pub fn config() -> Config {
    Config {
        connect_timeout_ms: 1_000,
        keep_alive_ms: 10_000,
        request_timeout_ms: 10_000,
        reconnect_base_ms: 100,
        reconnect_max_ms: 1_000,
        reconnect_attempts: 3,
        ..Default::default()
    }
}

pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    (0..20).map(|_| rng.sample(Alphanumeric) as char).collect()
}

pub fn random_data(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// A single file torrent of `data`.
pub fn descriptor(data: &[u8], piece_length: u32) -> TorrentDescriptor {
    let name = random_name();
    let piece_hashes = data
        .chunks(piece_length as usize)
        .map(|c| Sha1::from(c).digest().bytes())
        .collect();

    TorrentDescriptor {
        info_hash: InfoHash::random(),
        piece_hashes,
        piece_length,
        total_length: data.len() as u64,
        files: vec![FileEntry { path: vec![name.clone()], length: data.len() as u64 }],
        name,
    }
}

/// Spawn a Supervisor, returning its handle and the listener address.
pub async fn start(config: Config) -> (SupervisorHandle, Option<SocketAddr>) {
    let mut supervisor = Supervisor::new(config).await.unwrap();
    let handle = supervisor.handle();
    let addr = supervisor.local_addr();

    spawn(async move {
        supervisor.run().await.unwrap();
    });

    (handle, addr)
}

/// Poll the live state of a torrent until `f` holds, panics after `secs`.
pub async fn wait_state(
    handle: &SupervisorHandle,
    info_hash: &InfoHash,
    secs: u64,
    f: impl Fn(&TorrentState) -> bool,
) -> TorrentState {
    let deadline = Instant::now() + Duration::from_secs(secs);
    loop {
        let state = handle
            .torrent_state(info_hash)
            .await
            .unwrap()
            .expect("torrent exists");
        if f(&state) {
            return state;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for the torrent, last state: {state:?}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Poll `f` until it holds, panics after `secs`.
pub async fn wait_for(secs: u64, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while !f() {
        if Instant::now() > deadline {
            panic!("timed out waiting");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub fn switch_codec(
    socket: Framed<TcpStream, HandshakeCodec>,
) -> Framed<TcpStream, MessageCodec> {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

/// Connect to `addr` and do the handshake for `info_hash`.
pub async fn connect_leecher(
    addr: SocketAddr,
    info_hash: InfoHash,
) -> Framed<TcpStream, MessageCodec> {
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut socket = Framed::new(socket, HandshakeCodec);

    socket.send(Handshake::new(info_hash.clone(), PeerId::gen())).await.unwrap();
    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.info_hash, info_hash);

    switch_codec(socket)
}

/// The next message that is not a keep-alive, panics after 5 seconds.
pub async fn next_message(socket: &mut Framed<TcpStream, MessageCodec>) -> Message {
    loop {
        let msg = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("message in time")
            .expect("socket open")
            .expect("valid message");
        if msg != Message::KeepAlive {
            return msg;
        }
    }
}

#[derive(Clone, Debug)]
pub enum Mode {
    /// Answers every request with the right data.
    Honest,
    /// Sends garbage for the blocks of these pieces.
    Corrupt(Vec<usize>),
    /// Unchokes but never answers a request.
    Stall,
    /// Accepts the connection and never sends the handshake.
    Silent,
    /// Answers the handshake with another info hash.
    WrongInfoHash,
    /// Chokes us after the first request, and never unchokes again.
    ChokeAfterRequest,
    /// Sends its bitfield and then nothing at all, not even keep-alives.
    Quiet,
    /// Sends a `have` with a two byte payload after the bitfield.
    Malformed,
}

/// A connection of a [`MockPeer`] that was closed by the other side.
#[derive(Clone, Debug)]
pub struct Closed {
    pub keep_alives: usize,
    /// Time between the handshake and the close.
    pub after: Duration,
}

/// A remote peer with every piece of a torrent, listening on loopback.
pub struct MockPeer {
    pub addr: SocketAddr,
    requested: Arc<Mutex<Vec<BlockInfo>>>,
    cancelled: Arc<Mutex<Vec<BlockInfo>>>,
    closed: Arc<Mutex<Vec<Closed>>>,
    connections: Arc<AtomicUsize>,
}

impl MockPeer {
    pub async fn spawn(
        descriptor: &TorrentDescriptor,
        data: Vec<u8>,
        mode: Mode,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requested = Arc::new(Mutex::new(Vec::new()));
        let cancelled = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let data = Arc::new(data);
        let info_hash = descriptor.info_hash.clone();
        let piece_length = descriptor.piece_length as usize;
        let pieces = descriptor.pieces();

        {
            let requested = requested.clone();
            let cancelled = cancelled.clone();
            let closed = closed.clone();
            let connections = connections.clone();

            spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let conn = Conn {
                        data: data.clone(),
                        info_hash: info_hash.clone(),
                        piece_length,
                        pieces,
                        mode: mode.clone(),
                        requested: requested.clone(),
                        cancelled: cancelled.clone(),
                        closed: closed.clone(),
                    };
                    spawn(conn.run(socket));
                }
            });
        }

        Self { addr, requested, cancelled, closed, connections }
    }

    /// Every request received, on every connection.
    pub fn requested(&self) -> Vec<BlockInfo> {
        self.requested.lock().unwrap().clone()
    }

    pub fn requested_pieces(&self) -> Vec<u32> {
        let mut v: Vec<u32> =
            self.requested().into_iter().map(|b| b.index).collect();
        v.sort_unstable();
        v.dedup();
        v
    }

    /// Requests we cancelled, on every connection.
    pub fn cancelled(&self) -> Vec<BlockInfo> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Connections that we closed.
    pub fn closed(&self) -> Vec<Closed> {
        self.closed.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

struct Conn {
    data: Arc<Vec<u8>>,
    info_hash: InfoHash,
    piece_length: usize,
    pieces: usize,
    mode: Mode,
    requested: Arc<Mutex<Vec<BlockInfo>>>,
    cancelled: Arc<Mutex<Vec<BlockInfo>>>,
    closed: Arc<Mutex<Vec<Closed>>>,
}

impl Conn {
    async fn run(self, socket: TcpStream) {
        if let Mode::Silent = self.mode {
            let _socket = socket;
            sleep(Duration::from_secs(60)).await;
            return;
        }

        let mut socket = Framed::new(socket, HandshakeCodec);
        let Some(Ok(theirs)) = socket.next().await else { return };
        assert_eq!(theirs.info_hash, self.info_hash);

        let info_hash = match self.mode {
            Mode::WrongInfoHash => InfoHash::random(),
            _ => self.info_hash.clone(),
        };
        if socket.send(Handshake::new(info_hash, PeerId::gen())).await.is_err() {
            return;
        }

        let opened = Instant::now();
        let mut socket = switch_codec(socket);

        let mut bitfield = Bitfield::from_piece(self.pieces);
        bitfield.fill(true);
        if socket.send(Message::Bitfield(bitfield)).await.is_err() {
            return;
        }

        let sent = match self.mode {
            Mode::Quiet => true,
            Mode::Malformed => {
                socket.get_mut().write_all(&[0, 0, 0, 3, 4, 0, 0]).await.is_ok()
            }
            _ => socket.send(Message::Unchoke).await.is_ok(),
        };
        if !sent {
            return;
        }

        let mut keep_alives = 0;
        let mut choked = false;

        while let Some(Ok(msg)) = socket.next().await {
            let info = match msg {
                Message::KeepAlive => {
                    keep_alives += 1;
                    continue;
                }
                Message::Cancel(info) => {
                    self.cancelled.lock().unwrap().push(info);
                    continue;
                }
                Message::Request(info) => info,
                _ => continue,
            };
            self.requested.lock().unwrap().push(info.clone());

            let corrupt = match &self.mode {
                Mode::Stall => continue,
                Mode::ChokeAfterRequest => {
                    if !choked {
                        choked = true;
                        if socket.send(Message::Choke).await.is_err() {
                            break;
                        }
                    }
                    continue;
                }
                Mode::Corrupt(pieces) => pieces.contains(&(info.index as usize)),
                _ => false,
            };

            let start = info.index as usize * self.piece_length + info.begin as usize;
            let mut block = self.data[start..start + info.len as usize].to_vec();
            if corrupt {
                block.iter_mut().for_each(|b| *b = !*b);
            }

            let piece = Message::Piece(Block {
                index: info.index as usize,
                begin: info.begin,
                block,
            });
            if socket.send(piece).await.is_err() {
                break;
            }
        }

        self.closed
            .lock()
            .unwrap()
            .push(Closed { keep_alives, after: opened.elapsed() });
    }
}

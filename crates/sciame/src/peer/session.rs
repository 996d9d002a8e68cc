use tokio::time::Instant;

/// At any given time, a connection with a peer has 3 possible states.
/// ConnectionState means TCP connection, even if the peer is choked they are
/// still marked here as connected.
#[derive(Clone, Default, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The socket is open but the handshake is not done.
    #[default]
    Handshaking,

    /// Handshake done, downloading and uploading.
    Connected,

    /// The connection is going away, outstanding requests are being
    /// returned to the PieceManager.
    Closing,
}

impl ConnectionState {
    /// Connection states only move forward.
    pub fn advance(self, to: ConnectionState) -> ConnectionState {
        use ConnectionState::*;
        match (self, to) {
            (Handshaking, Connected) | (Handshaking | Connected, Closing) => to,
            (s, _) => s,
        }
    }
}

/// Holds and provides facilities to modify the state of a peer session.
#[derive(Debug)]
pub struct Session {
    /// The current state of the connection.
    pub connection: ConnectionState,

    /// The torrent is paused, no requests go out and no uploads are served.
    pub paused: bool,

    /// If the torrent was fully downloaded, all peers will become seed only.
    /// They will only seed but not download anything anymore.
    pub seed_only: bool,

    /// The number of block requests we keep outstanding.
    pub target_request_queue_len: usize,

    /// Any message other than keep-alive was received. A bitfield is only
    /// valid as the first message.
    pub received_first_msg: bool,

    /// Updated on every message received, used to detect dead connections.
    pub last_inbound: Instant,

    /// When we last sent a keep-alive because the peer was quiet.
    pub last_keep_alive: Option<Instant>,

    pub timed_out_request_count: usize,

    pub downloaded: u64,
    pub uploaded: u64,

    /// The time the connection was established (i.e. after handshaking)
    pub connected_time: Option<Instant>,
}

impl Session {
    pub fn new(target_request_queue_len: usize) -> Self {
        Self {
            connection: ConnectionState::default(),
            paused: false,
            seed_only: false,
            target_request_queue_len,
            received_first_msg: false,
            last_inbound: Instant::now(),
            last_keep_alive: None,
            timed_out_request_count: 0,
            downloaded: 0,
            uploaded: 0,
            connected_time: None,
        }
    }
}

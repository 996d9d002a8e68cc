//! The Supervisor is the entrypoint of the engine, it owns the running
//! torrents and routes commands and inbound connections to them.
//!
//! Callers talk to it through a [`SupervisorHandle`].
use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::StreamExt;
use hashbrown::HashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    spawn,
    sync::{broadcast, mpsc, oneshot, RwLock},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    descriptor::TorrentDescriptor,
    error::{Error, ErrorKind},
    peer::PeerId,
    storage::Storage,
    swarm::{PeerSource, SwarmMsg},
    torrent::{InfoHash, Torrent, TorrentMsg, TorrentState, TorrentStatus},
    wire::{Handshake, HandshakeCodec},
};

/// Pause of the listener after a failed `accept`.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Messages used by the [`Supervisor`] for internal communication.
#[derive(Debug)]
pub enum SupervisorMsg {
    AddTorrent {
        descriptor: TorrentDescriptor,
        storage: Arc<dyn Storage>,
        candidates: PeerSource,
        recipient: oneshot::Sender<Result<InfoHash, Error>>,
    },
    Pause(InfoHash, oneshot::Sender<Result<TorrentStatus, Error>>),
    Resume(InfoHash, oneshot::Sender<Result<TorrentStatus, Error>>),
    Stop(InfoHash, oneshot::Sender<Result<TorrentStatus, Error>>),
    /// Quit the torrent and forget about it.
    Remove(InfoHash, oneshot::Sender<Result<(), Error>>),
    /// Ask for a live [`TorrentState`] of the torrent with the given
    /// info_hash.
    RequestTorrentState(InfoHash, oneshot::Sender<Option<TorrentState>>),
    /// Sent by each Torrent every second.
    TorrentState(TorrentState),
    /// A Torrent hit an error, only fatal ones move it to the error state.
    TorrentError(InfoHash, Error),
    /// A remote peer connected to our listener and sent its handshake.
    Inbound {
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
    },
    /// Gracefully shutdown the Supervisor and its torrents.
    Quit,
}

/// Events broadcast to every subscriber of the Supervisor.
#[derive(Clone, Debug, PartialEq)]
pub enum SupervisorEvent {
    TorrentAdded(InfoHash),
    TorrentRemoved(InfoHash),
    TorrentError {
        info_hash: InfoHash,
        kind: ErrorKind,
        message: String,
    },
}

/// Context of the [`Supervisor`] that may be shared between other types.
#[derive(Debug)]
pub struct SupervisorCtx {
    pub tx: mpsc::Sender<SupervisorMsg>,
    pub local_peer_id: PeerId,
    /// States of all Torrents, updated each second by the Torrent struct.
    pub torrent_states: RwLock<HashMap<InfoHash, TorrentState>>,
    pub events: broadcast::Sender<SupervisorEvent>,
}

#[derive(Debug)]
struct TorrentHandle {
    tx: mpsc::UnboundedSender<TorrentMsg>,
    swarm_tx: mpsc::UnboundedSender<SwarmMsg>,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    pub config: Arc<Config>,
    pub ctx: Arc<SupervisorCtx>,
    /// key: info_hash
    torrents: HashMap<InfoHash, TorrentHandle>,
    rx: mpsc::Receiver<SupervisorMsg>,
    listener: Option<TcpListener>,
}

impl Supervisor {
    /// Validate the config and bind the listener, if there is one.
    pub async fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let listener = match config.listen_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let (tx, rx) = mpsc::channel::<SupervisorMsg>(300);
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            config: Arc::new(config),
            ctx: Arc::new(SupervisorCtx {
                tx,
                local_peer_id: PeerId::gen(),
                torrent_states: RwLock::new(HashMap::new()),
                events,
            }),
            torrents: HashMap::new(),
            rx,
            listener,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle { ctx: self.ctx.clone() }
    }

    #[tracing::instrument(name = "supervisor", skip_all)]
    pub async fn run(&mut self) -> Result<(), Error> {
        let listen_handle = self.listener.take().map(|listener| {
            let ctx = self.ctx.clone();
            let config = self.config.clone();
            info!("listening on {:?}", listener.local_addr());

            spawn(async move {
                loop {
                    let (socket, addr) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            // e.g. out of file descriptors, give it a moment
                            warn!("could not accept a connection: {e}");
                            sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let ctx = ctx.clone();
                    let config = config.clone();
                    spawn(async move {
                        if let Err(e) = Self::read_handshake(socket, ctx, config).await {
                            debug!("{addr} inbound failed: {e}");
                        }
                    });
                }
            })
        });

        while let Some(msg) = self.rx.recv().await {
            match msg {
                SupervisorMsg::AddTorrent { descriptor, storage, candidates, recipient } => {
                    let r = self.add_torrent(descriptor, storage, candidates).await;
                    let _ = recipient.send(r);
                }
                SupervisorMsg::Pause(info_hash, recipient) => {
                    match self.torrents.get(&info_hash) {
                        Some(t) => {
                            let _ = t.tx.send(TorrentMsg::Pause(recipient));
                        }
                        None => {
                            let _ = recipient.send(Err(Error::TorrentDoesNotExist));
                        }
                    }
                }
                SupervisorMsg::Resume(info_hash, recipient) => {
                    match self.torrents.get(&info_hash) {
                        Some(t) => {
                            let _ = t.tx.send(TorrentMsg::Resume(recipient));
                        }
                        None => {
                            let _ = recipient.send(Err(Error::TorrentDoesNotExist));
                        }
                    }
                }
                SupervisorMsg::Stop(info_hash, recipient) => {
                    match self.torrents.get(&info_hash) {
                        Some(t) => {
                            let _ = t.tx.send(TorrentMsg::Stop(recipient));
                        }
                        None => {
                            let _ = recipient.send(Err(Error::TorrentDoesNotExist));
                        }
                    }
                }
                SupervisorMsg::Remove(info_hash, recipient) => {
                    let r = self.remove_torrent(&info_hash).await;
                    let _ = recipient.send(r);
                }
                SupervisorMsg::RequestTorrentState(info_hash, recipient) => {
                    let Some(t) = self.torrents.get(&info_hash) else {
                        let _ = recipient.send(None);
                        continue;
                    };

                    // the torrent answers from its own loop, don't wait for
                    // it here.
                    let (otx, orx) = oneshot::channel();
                    if t.tx.send(TorrentMsg::GetState(otx)).is_err() {
                        let states = self.ctx.torrent_states.read().await;
                        let _ = recipient.send(states.get(&info_hash).cloned());
                        continue;
                    }
                    spawn(async move {
                        let _ = recipient.send(orx.await.ok());
                    });
                }
                SupervisorMsg::TorrentState(state) => {
                    if self.torrents.contains_key(&state.info_hash) {
                        let mut states = self.ctx.torrent_states.write().await;
                        states.insert(state.info_hash.clone(), state);
                    }
                }
                SupervisorMsg::TorrentError(info_hash, error) => {
                    if error.is_fatal() {
                        warn!("torrent {info_hash:?} failed: {error}");

                        let mut states = self.ctx.torrent_states.write().await;
                        if let Some(state) = states.get_mut(&info_hash) {
                            state.status = TorrentStatus::Error;
                            state.error = Some(error.to_string());
                        }
                    }

                    let _ = self.ctx.events.send(SupervisorEvent::TorrentError {
                        info_hash,
                        kind: error.kind(),
                        message: error.to_string(),
                    });
                }
                SupervisorMsg::Inbound { socket, handshake } => {
                    match self.torrents.get(&handshake.info_hash) {
                        Some(t) => {
                            let _ = t.swarm_tx.send(SwarmMsg::Inbound { socket, handshake });
                        }
                        None => {
                            debug!(
                                "inbound peer for unknown torrent {:?}",
                                handshake.info_hash
                            );
                        }
                    }
                }
                SupervisorMsg::Quit => {
                    info!("quitting");
                    for t in self.torrents.values() {
                        let _ = t.tx.send(TorrentMsg::Quit);
                    }
                    self.torrents.clear();
                    break;
                }
            }
        }

        if let Some(handle) = listen_handle {
            handle.abort();
        }

        Ok(())
    }

    /// Read the handshake of a peer that connected to us, to find out which
    /// torrent it wants.
    async fn read_handshake(
        socket: TcpStream,
        ctx: Arc<SupervisorCtx>,
        config: Arc<Config>,
    ) -> Result<(), Error> {
        let mut socket = Framed::new(socket, HandshakeCodec);

        let handshake = match timeout(config.connect_timeout(), socket.next()).await {
            Ok(Some(Ok(handshake))) => handshake,
            Ok(Some(Err(_))) => return Err(Error::HandshakeInvalid),
            Ok(None) => return Err(Error::NoHandshake),
            Err(_) => return Err(Error::HandshakeTimeout),
        };

        ctx.tx.send(SupervisorMsg::Inbound { socket, handshake }).await?;
        Ok(())
    }

    async fn add_torrent(
        &mut self,
        descriptor: TorrentDescriptor,
        storage: Arc<dyn Storage>,
        candidates: PeerSource,
    ) -> Result<InfoHash, Error> {
        let info_hash = descriptor.info_hash.clone();

        if self.torrents.contains_key(&info_hash) {
            return Err(Error::NoDuplicateTorrent);
        }
        if self.torrents.len() >= self.config.max_torrents {
            return Err(Error::TooManyTorrents(self.config.max_torrents));
        }

        let mut torrent = Torrent::new(
            descriptor,
            storage,
            candidates,
            self.config.clone(),
            self.ctx.local_peer_id.clone(),
            self.ctx.tx.clone(),
        )?;

        info!("adding torrent {info_hash:?} {}", torrent.ctx.descriptor.name);

        let state = TorrentState {
            name: torrent.ctx.descriptor.name.clone(),
            info_hash: info_hash.clone(),
            size: torrent.ctx.descriptor.total_length,
            pieces: torrent.ctx.descriptor.pieces(),
            ..Default::default()
        };
        self.ctx.torrent_states.write().await.insert(info_hash.clone(), state);

        let tx = torrent.ctx.tx.clone();
        let swarm_tx = torrent.ctx.swarm_tx.clone();
        let handle = spawn(async move {
            if let Err(e) = torrent.run().await {
                warn!("torrent stopped: {e}");
            }
        });

        self.torrents
            .insert(info_hash.clone(), TorrentHandle { tx, swarm_tx, handle });
        let _ = self.ctx.events.send(SupervisorEvent::TorrentAdded(info_hash.clone()));

        Ok(info_hash)
    }

    async fn remove_torrent(&mut self, info_hash: &InfoHash) -> Result<(), Error> {
        let t = self
            .torrents
            .remove(info_hash)
            .ok_or(Error::TorrentDoesNotExist)?;

        if t.tx.send(TorrentMsg::Quit).is_err() {
            t.handle.abort();
        }
        self.ctx.torrent_states.write().await.remove(info_hash);
        let _ = self.ctx.events.send(SupervisorEvent::TorrentRemoved(info_hash.clone()));

        info!("removed torrent {info_hash:?}");
        Ok(())
    }
}

/// Cloneable way to command a running [`Supervisor`].
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    ctx: Arc<SupervisorCtx>,
}

impl SupervisorHandle {
    /// Start a session for `descriptor`. Errors if the descriptor is not
    /// valid, the torrent was already added, or the torrent limit was
    /// reached.
    pub async fn add_torrent(
        &self,
        descriptor: TorrentDescriptor,
        storage: Arc<dyn Storage>,
        candidates: PeerSource,
    ) -> Result<InfoHash, Error> {
        let (otx, orx) = oneshot::channel();
        self.ctx
            .tx
            .send(SupervisorMsg::AddTorrent {
                descriptor,
                storage,
                candidates,
                recipient: otx,
            })
            .await?;
        orx.await?
    }

    pub async fn pause(&self, info_hash: &InfoHash) -> Result<TorrentStatus, Error> {
        let (otx, orx) = oneshot::channel();
        self.ctx.tx.send(SupervisorMsg::Pause(info_hash.clone(), otx)).await?;
        orx.await?
    }

    pub async fn resume(&self, info_hash: &InfoHash) -> Result<TorrentStatus, Error> {
        let (otx, orx) = oneshot::channel();
        self.ctx.tx.send(SupervisorMsg::Resume(info_hash.clone(), otx)).await?;
        orx.await?
    }

    /// Stop uploading, the torrent becomes [`TorrentStatus::Completed`].
    pub async fn stop(&self, info_hash: &InfoHash) -> Result<TorrentStatus, Error> {
        let (otx, orx) = oneshot::channel();
        self.ctx.tx.send(SupervisorMsg::Stop(info_hash.clone(), otx)).await?;
        orx.await?
    }

    pub async fn remove(&self, info_hash: &InfoHash) -> Result<(), Error> {
        let (otx, orx) = oneshot::channel();
        self.ctx.tx.send(SupervisorMsg::Remove(info_hash.clone(), otx)).await?;
        orx.await?
    }

    /// A live snapshot of the torrent, None if it doesn't exist.
    pub async fn torrent_state(
        &self,
        info_hash: &InfoHash,
    ) -> Result<Option<TorrentState>, Error> {
        let (otx, orx) = oneshot::channel();
        self.ctx
            .tx
            .send(SupervisorMsg::RequestTorrentState(info_hash.clone(), otx))
            .await?;
        Ok(orx.await?)
    }

    /// The states published by the torrents in the last second.
    pub async fn torrent_states(&self) -> Vec<TorrentState> {
        self.ctx.torrent_states.read().await.values().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.ctx.events.subscribe()
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.ctx.local_peer_id
    }

    pub async fn quit(&self) -> Result<(), Error> {
        self.ctx.tx.send(SupervisorMsg::Quit).await?;
        Ok(())
    }
}

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    time::{timeout_at, Instant},
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

use super::{Direction, Peer};
use crate::{
    error::Error,
    torrent::TorrentCtx,
    wire::{Handshake, HandshakeCodec, MessageCodec},
};

impl Peer {
    /// Connect to `addr` and exchange handshakes, both within the connect
    /// timeout.
    pub async fn connect(
        addr: SocketAddr,
        torrent_ctx: Arc<TorrentCtx>,
    ) -> Result<Peer, Error> {
        let deadline = Instant::now() + torrent_ctx.config.connect_timeout();

        let socket = timeout_at(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout)??;

        debug!("{addr} connected, sending the first handshake");

        let ours = Handshake::new(
            torrent_ctx.info_hash.clone(),
            torrent_ctx.local_peer_id.clone(),
        );
        let mut socket = Framed::new(socket, HandshakeCodec);

        let theirs = timeout_at(deadline, async {
            socket.send(ours.clone()).await?;
            match socket.next().await {
                Some(Ok(theirs)) => Ok::<_, Error>(theirs),
                Some(Err(e)) => {
                    warn!("{addr} sent an invalid handshake: {e}");
                    Err(Error::HandshakeInvalid)
                }
                None => Err(Error::NoHandshake),
            }
        })
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

        theirs.validate(&ours)?;

        Peer::new(
            switch_codec(socket),
            Direction::Outbound,
            theirs.peer_id,
            torrent_ctx,
        )
    }

    /// Answer a peer that connected to us, their handshake was already read
    /// to find out which torrent they want.
    pub async fn accept(
        mut socket: Framed<TcpStream, HandshakeCodec>,
        theirs: Handshake,
        torrent_ctx: Arc<TorrentCtx>,
    ) -> Result<Peer, Error> {
        let ours = Handshake::new(
            torrent_ctx.info_hash.clone(),
            torrent_ctx.local_peer_id.clone(),
        );
        theirs.validate(&ours)?;

        debug!(
            "{:?} sending the second handshake",
            socket.get_ref().peer_addr()
        );

        tokio::time::timeout(
            torrent_ctx.config.connect_timeout(),
            socket.send(ours),
        )
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

        Peer::new(
            switch_codec(socket),
            Direction::Inbound,
            theirs.peer_id,
            torrent_ctx,
        )
    }
}

/// Replace the handshake codec, keeping bytes that were already read or
/// not yet written.
fn switch_codec(
    socket: Framed<TcpStream, HandshakeCodec>,
) -> Framed<TcpStream, MessageCodec> {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

//! UDP input relay
//!
//! One loop per room reads datagrams and handles them strictly in arrival
//! order. Handling a datagram mutates the sync state under its lock and
//! produces the datagrams to send; they are written after the lock is
//! released.

use crate::session::{shutdown_signal, Session};
use crate::sync::DigestCheck;
use crate::RoomError;
use bytes::{Bytes, BytesMut};
use netplay_protocol::{ClientPacket, ServerInput};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

/// Receive buffer, larger than any valid datagram
const RECV_BUFFER_SIZE: usize = 1500;

/// DSCP class selector 4, shifted into the TOS byte
#[cfg(target_os = "linux")]
const DSCP_CS4: i32 = 32 << 2;

/// Datagram to send after processing
pub type Outgoing = (SocketAddr, Bytes);

fn encode(packet: &ServerInput) -> Bytes {
    let mut buf = BytesMut::new();
    packet.encode(&mut buf);
    buf.freeze()
}

/// Handle one datagram from `from`. The source IP must belong to an
/// admitted player; anything else is dropped.
pub async fn process_datagram(
    session: &Session,
    from: SocketAddr,
    datagram: &[u8],
) -> Result<Vec<Outgoing>, RoomError> {
    if !session.is_known_ip(from.ip()).await {
        warn!(%from, "invalid udp connection: bad IP");
        return Ok(Vec::new());
    }

    match ClientPacket::decode(datagram)? {
        ClientPacket::KeyInfo(info) => {
            let fan_out = session.sync().lock().await.record_key_info(from, &info);
            Ok(fan_out
                .iter()
                .map(|(addr, packet)| (*addr, encode(packet)))
                .collect())
        }
        ClientPacket::InputRequest(req) => {
            session.sync().lock().await.observe_request(&req);

            let Some(requester) = session.slot_for_nonce(req.nonce).await else {
                warn!(nonce = req.nonce, %from, "could not process request: unknown nonce");
                return Ok(Vec::new());
            };

            let reply = session.sync().lock().await.answer_request(requester, &req);
            Ok(reply
                .packet
                .map(|packet| vec![(from, encode(&packet))])
                .unwrap_or_default())
        }
        ClientPacket::Cp0Info(info) => {
            let (outcome, slot) = {
                let mut sync = session.sync().lock().await;
                let outcome = sync.check_digest(info.vi_count, &info.digest);
                (outcome, sync.slot_for_addr(from))
            };
            if outcome == DigestCheck::Mismatch {
                let room = session.info().await;
                let num_players = session.player_count().await;
                let play_time = session.play_time().await;
                error!(
                    slot = ?slot,
                    vi_count = info.vi_count,
                    num_players,
                    client_sha = %room.client_sha,
                    play_time = ?play_time,
                    emulator = %room.emulator,
                    features = ?room.features,
                    "game has desynced"
                );
            }
            Ok(Vec::new())
        }
    }
}

/// Errors a UDP socket reports for an earlier send to an unreachable peer
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

/// Read loop for the room's UDP socket. Runs until the room shuts down; a
/// fatal socket error shuts the room down.
pub async fn run(session: Arc<Session>, socket: Arc<UdpSocket>) {
    let mut shutdown = session.subscribe_shutdown();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        let (len, from) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) if is_transient(&e) => {
                    debug!("ignoring UDP error: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("error from UDP socket: {}", e);
                    session.shutdown();
                    break;
                }
            },
            _ = shutdown_signal(&mut shutdown) => break,
        };

        let outgoing = match process_datagram(&session, from, &buf[..len]).await {
            Ok(outgoing) => outgoing,
            Err(e) => {
                debug!(%from, "dropping datagram: {}", e);
                continue;
            }
        };

        for (addr, datagram) in outgoing {
            if let Err(e) = socket.send_to(&datagram, addr).await {
                warn!(%addr, "could not send input: {}", e);
            }
        }
    }

    info!("UDP server closed");
}

/// Mark input traffic as CS4 so routers can prioritize it
#[cfg(target_os = "linux")]
pub fn set_dscp(socket: &UdpSocket) {
    use nix::sys::socket::{setsockopt, sockopt};

    let result = match socket.local_addr() {
        Ok(addr) if addr.is_ipv4() => setsockopt(socket, sockopt::IpTos, &DSCP_CS4),
        Ok(_) => setsockopt(socket, sockopt::Ipv6TClass, &DSCP_CS4),
        Err(e) => {
            warn!("could not read UDP socket address: {}", e);
            return;
        }
    };
    if let Err(e) = result {
        warn!("could not set DSCP: {}", e);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_dscp(_socket: &UdpSocket) {}

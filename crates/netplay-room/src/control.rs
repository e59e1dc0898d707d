//! TCP control channel
//!
//! Each accepted connection gets its own task running a [`ControlParser`].
//! Requests that need data another peer has not uploaded yet (save files,
//! settings, custom blobs, the registration table) are answered by a
//! separate sender task that polls the session until the data appears, so
//! the reader keeps going in the meantime.

use crate::session::{shutdown_signal, Session};
use bytes::Bytes;
use netplay_protocol::control::{encode_registration_reply, ControlParser, ControlRequest};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, error, info, warn, Instrument};

/// Write half shared between a connection's reader and its sender tasks
type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

const READ_BUFFER_SIZE: usize = 1500;

/// Accept control connections until the room shuts down. Connections from
/// IPs outside the roster are closed immediately.
pub async fn accept_loop(session: Arc<Session>, listener: TcpListener) {
    let mut shutdown = session.subscribe_shutdown();

    loop {
        let (stream, peer) = tokio::select! {
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("error from TCP listener: {}", e);
                    continue;
                }
            },
            _ = shutdown_signal(&mut shutdown) => break,
        };

        if !session.is_known_ip(peer.ip()).await {
            warn!(%peer, "invalid tcp connection: bad IP");
            continue;
        }

        info!(%peer, "received TCP connection");
        let session = session.clone();
        let span = session.span().clone();
        tokio::spawn(serve_connection(session, stream, peer).instrument(span));
    }

    info!("TCP server closed");
}

/// Read loop for one control connection
async fn serve_connection(session: Arc<Session>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, "could not set TCP_NODELAY: {}", e);
    }
    let (mut reader, writer) = stream.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    let mut parser = ControlParser::new(session.settings_size());
    let mut shutdown = session.subscribe_shutdown();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(%peer, "remote side closed TCP connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    info!(%peer, "could not read TCP message: {}", e);
                    break;
                }
            },
            _ = shutdown_signal(&mut shutdown) => break,
        };
        parser.feed(&buf[..n]);

        loop {
            match parser.next_request() {
                Ok(Some(request)) => {
                    if let Err(e) = handle_request(&session, &writer, peer, request).await {
                        info!(%peer, "TCP write failed: {}", e);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => warn!(%peer, "dropping control request: {}", e),
            }
        }
    }
}

/// Apply one parsed request. Only the registration reply is written inline;
/// everything that may have to wait is handed to a sender task.
async fn handle_request(
    session: &Arc<Session>,
    writer: &SharedWriter,
    peer: SocketAddr,
    request: ControlRequest,
) -> std::io::Result<()> {
    match request {
        ControlRequest::SendSave { filename, data } => {
            info!(%peer, %filename, filesize = data.len(), "received save file");
            session.store_file(filename, data).await;
        }
        ControlRequest::ReceiveSave {
            filename,
            with_size,
        } => {
            let what = format!("save file {filename}");
            spawn_sender(session, writer, peer, what, with_size, move |s| {
                let filename = filename.clone();
                async move { s.file(&filename).await }
            });
        }
        ControlRequest::SendSettings(data) => {
            debug!(%peer, "received settings");
            session.store_settings(data).await;
        }
        ControlRequest::ReceiveSettings => {
            spawn_sender(
                session,
                writer,
                peer,
                "settings".into(),
                false,
                |s| async move { s.settings().await },
            );
        }
        ControlRequest::RegisterPlayer(registration) => {
            let outcome = session.register(registration).await;
            let reply =
                encode_registration_reply(outcome.accepted(), session.buffer_target().await);
            writer.lock().await.write_all(&reply).await?;
        }
        ControlRequest::GetRegistration => {
            spawn_sender(
                session,
                writer,
                peer,
                "registration table".into(),
                false,
                |s| async move {
                    s.registration_table()
                        .await
                        .map(|table| Bytes::copy_from_slice(&table))
                },
            );
        }
        ControlRequest::DisconnectNotice { nonce } => {
            if session.disconnect(nonce).await.is_none() {
                debug!(%peer, nonce, "disconnect notice for unknown nonce");
            }
        }
        ControlRequest::CustomSend { key, data } => {
            debug!(%peer, key, size = data.len(), "received custom data");
            session.store_custom(key, data).await;
        }
        ControlRequest::CustomReceive { key } => {
            spawn_sender(
                session,
                writer,
                peer,
                format!("custom data {key}"),
                false,
                move |s| async move { s.custom(key).await },
            );
        }
    }
    Ok(())
}

/// Spawn a task that waits for `probe` to yield data and writes it to the
/// connection, optionally preceded by its 4-byte length. Gives up after the
/// room's blob timeout or when the room shuts down.
fn spawn_sender<F, Fut>(
    session: &Arc<Session>,
    writer: &SharedWriter,
    peer: SocketAddr,
    what: String,
    with_size: bool,
    probe: F,
) where
    F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Bytes>> + Send,
{
    let session = session.clone();
    let writer = writer.clone();
    let span = session.span().clone();

    tokio::spawn(
        async move {
            let Some(data) = wait_for(&session, || probe(session.clone())).await else {
                info!(%peer, "TCP connection timed out waiting for {}", what);
                return;
            };

            let mut writer = writer.lock().await;
            let result = async {
                if with_size {
                    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
                }
                if !data.is_empty() {
                    writer.write_all(&data).await?;
                }
                Ok::<_, std::io::Error>(())
            }
            .await;

            match result {
                Ok(()) => debug!(%peer, size = data.len(), "sent {}", what),
                Err(e) => error!(%peer, "could not write {}: {}", what, e),
            }
        }
        .instrument(span),
    );
}

/// Poll `probe` until it yields a value, the blob timeout elapses, or the
/// room shuts down.
pub async fn wait_for<T, F, Fut>(session: &Session, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let timings = session.timings();
    let mut shutdown = session.subscribe_shutdown();

    let poll = async {
        loop {
            if let Some(value) = probe().await {
                return Some(value);
            }
            tokio::select! {
                _ = time::sleep(timings.blob_poll) => {}
                _ = shutdown_signal(&mut shutdown) => return None,
            }
        }
    };

    time::timeout(timings.blob_timeout, poll)
        .await
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::session::RoomInfo;
    use std::time::Duration;
    use tracing::Span;

    fn session(timeout: Duration) -> Arc<Session> {
        let timings = Timings {
            blob_timeout: timeout,
            blob_poll: Duration::from_millis(10),
            ..Default::default()
        };
        Arc::new(Session::new(RoomInfo::default(), 24, timings, Span::none()))
    }

    #[tokio::test]
    async fn test_wait_for_sees_late_data() {
        let s = session(Duration::from_secs(5));
        let uploader = s.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            uploader
                .store_file("late.st".into(), Bytes::from_static(b"abc"))
                .await;
        });

        let got = wait_for(&s, || s.file("late.st")).await;
        assert_eq!(got, Some(Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let s = session(Duration::from_millis(50));
        assert_eq!(wait_for(&s, || s.file("never")).await, None);
    }

    #[tokio::test]
    async fn test_wait_for_stops_on_shutdown() {
        let s = session(Duration::from_secs(60));
        let closer = s.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            closer.shutdown();
        });
        let got = time::timeout(Duration::from_secs(5), wait_for(&s, || s.settings())).await;
        assert_eq!(got.expect("returned before test timeout"), None);
    }
}

//! Background loops started with the game: buffer-size control and the
//! liveness sweep that eventually closes an abandoned room.

use crate::session::{shutdown_signal, Session};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, Instrument};

/// Start both loops inside the room's span
pub fn spawn(session: &Arc<Session>) -> Vec<JoinHandle<()>> {
    let span = session.span().clone();
    vec![
        tokio::spawn(manage_buffers(session.clone()).instrument(span.clone())),
        tokio::spawn(manage_players(session.clone()).instrument(span)),
    ]
}

async fn manage_buffers(session: Arc<Session>) {
    let mut shutdown = session.subscribe_shutdown();
    let mut ticker = time::interval(session.timings().buffer_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_signal(&mut shutdown) => break,
        }
        if !session.is_running() {
            break;
        }
        let target = session.buffer_target().await;
        session.sync().lock().await.adjust_buffer_sizes(target);
    }

    debug!("done managing buffers");
}

async fn manage_players(session: Arc<Session>) {
    let mut shutdown = session.subscribe_shutdown();
    let timings = session.timings().clone();

    tokio::select! {
        _ = time::sleep(timings.liveness_grace) => {}
        _ = shutdown_signal(&mut shutdown) => return,
    }

    while sweep(&session).await {
        tokio::select! {
            _ = time::sleep(timings.liveness_interval) => {}
            _ = shutdown_signal(&mut shutdown) => return,
        }
    }
}

/// One liveness pass. Registered slots that sent nothing since the last pass
/// are flagged and unregistered. Returns false, after shutting the room
/// down, when no registered slot was alive.
pub async fn sweep(session: &Session) -> bool {
    let registrations = session.registrations().await;
    let registered = registrations.map(|r| r.is_some());

    let report = session.sync().lock().await.sweep_liveness(registered);

    for &slot in &report.dead {
        if let Some(reg) = registrations[slot] {
            session.unregister(slot, reg.nonce).await;
        }
    }

    if report.alive.is_empty() {
        let num_players = session.player_count().await;
        let play_time = session.play_time().await;
        let emulator = session.info().await.emulator;
        info!(
            num_players,
            play_time = ?play_time,
            emulator = %emulator,
            "no more players, closing room"
        );
        session.shutdown();
        return false;
    }
    true
}

//! One chat session: the loop that serializes user lines, agent replies and
//! timer/readiness callbacks into a single [`MessageDispatcher`].

use tokio::sync::{broadcast, mpsc};

use crate::{
    dispatcher::{MessageDispatcher, RouterContext},
    protocol::SessionEvent,
    types::SessionKey,
};

/// Runs until the client's line stream ends or the reply topic closes.
pub async fn run_session(
    ctx: RouterContext,
    session: SessionKey,
    mut lines: mpsc::Receiver<String>,
    out: mpsc::Sender<SessionEvent>,
) {
    // subscribe before open so a ready sentinel published during start-up
    // is not missed
    let mut replies = ctx.mailbox.subscribe_replies(&session);
    let mailbox = ctx.mailbox.clone();
    let (mut dispatcher, mut inputs) = MessageDispatcher::new(ctx, session.clone(), out);

    tracing::info!(target = "router::session", session = %session, "session started");
    dispatcher.open().await;

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                dispatcher.handle_user_line(&line).await;
            }
            reply = replies.recv() => match reply {
                Ok(raw) => dispatcher.handle_agent_reply(&raw).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target = "router::session",
                        session = %session,
                        skipped = skipped,
                        "reply subscriber lagged, replies dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(timer) = inputs.timers.recv() => {
                dispatcher.handle_typing_timer(timer).await;
            }
            Some(report) = inputs.readiness.recv() => {
                dispatcher.handle_readiness(report).await;
            }
        }
    }

    dispatcher.close();
    drop(replies);
    mailbox.release_session(&session);
}

//! The cooperative loop every actor runs on.
//!
//! An actor wakes for one of three reasons: shutdown, a message, or the
//! delay it returned from [`Actor::next_wakeup`]. Shutdown always wins.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// State plus behavior driven by one mailbox. Messages are handled one at
/// a time.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    /// How long until the actor wants [`on_wakeup`](Self::on_wakeup).
    /// `None` means only messages wake it.
    fn next_wakeup(&mut self) -> Option<Duration> {
        None
    }

    /// Called when the wakeup from [`next_wakeup`](Self::next_wakeup) elapses.
    async fn on_wakeup(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Per-loop bookkeeping handed to every callback.
#[derive(Debug)]
pub struct ActorContext {
    pub actor_id: String,
    pub messages_processed: u64,
    pub wakeups: u64,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ActorError {
    /// Logged; the loop keeps running.
    #[error("{0}")]
    Recoverable(String),

    /// The loop stops after `on_stop`.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The actor's mailbox is closed.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Waits for mailbox space; fails once the actor has stopped.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Control side of a running actor.
pub struct ActorRef {
    pub actor_id: String,
    task_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the actor task to end.
    pub async fn join(self) {
        if let Err(e) = self.task_handle.await {
            error!(actor_id = %self.actor_id, error = %e, "Actor task panicked");
        }
    }
}

/// Spawn an actor on the current tokio runtime.
pub fn spawn_actor<A: Actor>(actor: A, mailbox_size: usize) -> (ActorHandle<A::Message>, ActorRef) {
    let actor_id = format!("{}_{}", actor.name(), generate_actor_id());
    let (tx, rx) = mpsc::channel(mailbox_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_id = actor_id.clone();
    let task_handle = tokio::spawn(async move {
        run_actor_loop(actor, rx, shutdown_rx, loop_id).await;
    });
    info!(actor_id = %actor_id, "Spawned actor");

    (
        ActorHandle {
            tx,
            actor_id: actor_id.clone(),
        },
        ActorRef {
            actor_id,
            task_handle,
            shutdown_tx,
        },
    )
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext {
        actor_id: actor_id.clone(),
        messages_processed: 0,
        wakeups: 0,
    };

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    debug!(actor_id = %actor_id, "Actor started");

    loop {
        let wakeup = actor.next_wakeup();
        let sleep = async move {
            match wakeup {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
                continue;
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                ctx.messages_processed += 1;
                actor.handle(msg, &mut ctx).await
            }

            _ = sleep => {
                ctx.wakeups += 1;
                actor.on_wakeup(&mut ctx).await.map(|()| true)
            }
        };

        match outcome {
            Ok(true) => {}
            Ok(false) => {
                info!(actor_id = %actor_id, "Actor requested stop");
                break;
            }
            Err(e @ ActorError::Fatal(_)) => {
                error!(actor_id = %actor_id, error = %e, "Actor failed");
                break;
            }
            Err(e) => warn!(actor_id = %actor_id, error = %e, "Actor error"),
        }
    }

    actor.on_stop(&mut ctx).await;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        wakeups = ctx.wakeups,
        "Actor stopped"
    );
}

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

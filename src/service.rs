//! Service task that owns the host bus.
//!
//! The transport core is driven from one place. Interrupt-like sources (the
//! vsync tick, "queue has work" wakeups from producers, shutdown) are posted
//! to a bounded mailbox and handled in order by a single loop. Handshake
//! waits spin on the link, so that loop runs on the blocking pool and never
//! on an executor thread. A small async ticker posts `ProcessQueue` on the
//! poll interval to cover retries and sync pushes when nothing else is
//! posted; it holds only a weak sender and stops with the loop.
//!
//! # Architecture
//!
//! ```text
//! producer 1 ─┐  enqueue (queue lock only)
//! producer 2 ─┼─► per-peer queues ◄──────────────┐
//!             │                                   │
//!             └─► mpsc::Sender<ControlEvent> ─► service loop ─► links
//!    ticker ─── WeakSender ──────┘                (blocking pool)
//!                                                 │
//!                        BusEvent ◄───────────────┘
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::error::{BusError, Result};
use crate::host::{BusEvent, BusHandle, HostBus};
use crate::peer::PeerId;
use crate::protocol::Command;
use crate::transport::Link;

/// Mailbox message for the service task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// A video frame started.
    Vsync,
    /// A producer queued work.
    ProcessQueue,
    /// Stop the task.
    Shutdown,
}

/// Handle for producers and the frame driver.
///
/// Cheaply cloneable. Enqueueing never waits on link I/O.
#[derive(Clone)]
pub struct ServiceHandle {
    bus: BusHandle,
    tx: mpsc::Sender<ControlEvent>,
}

impl ServiceHandle {
    /// Underlying queue handle.
    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    /// Whether the service task is still accepting events.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a command and wake the service task.
    pub fn enqueue(&self, peer: PeerId, command: Command, requires_ack: bool) -> Result<u64> {
        if self.tx.is_closed() {
            return Err(BusError::ServiceStopped);
        }
        let seq = self.bus.enqueue(peer, command, requires_ack)?;
        match self.tx.try_send(ControlEvent::ProcessQueue) {
            // A full mailbox already holds a wakeup.
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(seq),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::ServiceStopped),
        }
    }

    /// Build, queue and wake.
    pub fn send(
        &self,
        peer: PeerId,
        command_id: u8,
        payload: impl Into<Bytes>,
        requires_ack: bool,
    ) -> Result<u64> {
        self.enqueue(peer, Command::new(command_id, payload)?, requires_ack)
    }

    /// Signal the start of a video frame.
    pub async fn vsync(&self) -> Result<()> {
        self.post(ControlEvent::Vsync).await
    }

    /// Ask the service task to stop after the current event.
    pub async fn shutdown(&self) -> Result<()> {
        self.post(ControlEvent::Shutdown).await
    }

    async fn post(&self, event: ControlEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| BusError::ServiceStopped)
    }
}

/// Spawn the service task around `host`.
///
/// Must be called from within a tokio runtime. The bus itself runs on the
/// runtime's blocking pool.
///
/// # Returns
///
/// The producer handle, a stream of [`BusEvent`]s and the task's join
/// handle. The task ends on [`ServiceHandle::shutdown`] or once every
/// handle is dropped.
pub fn spawn_service_task<L>(
    host: HostBus<L>,
) -> (
    ServiceHandle,
    mpsc::UnboundedReceiver<BusEvent>,
    JoinHandle<Result<()>>,
)
where
    L: Link + 'static,
{
    let (tx, rx) = mpsc::channel(host.config().mailbox_capacity);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    tokio::spawn(ticker(tx.downgrade(), host.config().poll_interval()));

    let handle = ServiceHandle {
        bus: host.handle(),
        tx,
    };
    let task = tokio::task::spawn_blocking(move || service_loop(host, rx, events_tx));

    (handle, events_rx, task)
}

async fn ticker(tx: mpsc::WeakSender<ControlEvent>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(tx) = tx.upgrade() else {
            break;
        };
        match tx.try_send(ControlEvent::ProcessQueue) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    trace!("Service ticker stopped");
}

fn service_loop<L: Link>(
    mut host: HostBus<L>,
    mut rx: mpsc::Receiver<ControlEvent>,
    events: mpsc::UnboundedSender<BusEvent>,
) -> Result<()> {
    loop {
        let stop = match rx.blocking_recv() {
            Some(ControlEvent::Vsync) => {
                host.on_frame();
                host.service_tick();
                false
            }
            Some(ControlEvent::ProcessQueue) => {
                host.service_tick();
                false
            }
            Some(ControlEvent::Shutdown) | None => true,
        };

        for event in host.take_events() {
            if events.send(event).is_err() {
                debug!("Event receiver dropped");
            }
        }

        if stop {
            info!("Bus service stopping at frame {}", host.frame_counter());
            return Ok(());
        }
    }
}

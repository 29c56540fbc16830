//! Connectivity tracking and automatic sync on reconnection.
//!
//! The monitor probes the API on a fixed interval and also accepts connectivity
//! events pushed by the host. A transition to online arms a grace timer; when it
//! fires the queue is synced once. Going offline again before then disarms it,
//! and further online reports while armed do not restart it.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use super::service::ControlService;
use crate::error::{Result, SyncError};
use crate::http::Transport;
use crate::store::now_millis;

/// Shortest accepted poll interval; a zero period would stop the monitor.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
  Online { connection_type: Option<String> },
  Offline,
}

pub struct ConnectivityMonitor {
  service: Arc<ControlService>,
  transport: Arc<dyn Transport>,
  poll_interval: Duration,
  grace_period: Duration,
}

/// Running monitor. Dropping it leaves the task running; call `shutdown`.
pub struct MonitorHandle {
  events: mpsc::UnboundedSender<ConnectivityEvent>,
  shutdown: Arc<Notify>,
  task: JoinHandle<()>,
}

impl MonitorHandle {
  /// Push a connectivity change observed outside the monitor.
  pub fn report(&self, event: ConnectivityEvent) -> Result<()> {
    self
      .events
      .send(event)
      .map_err(|_| SyncError::ControlChannel("connectivity monitor stopped".into()))
  }

  pub async fn shutdown(self) {
    self.shutdown.notify_one();
    if let Err(e) = self.task.await {
      warn!(error = %e, "connectivity monitor task failed");
    }
  }
}

impl ConnectivityMonitor {
  pub fn new(
    service: Arc<ControlService>,
    transport: Arc<dyn Transport>,
    poll_interval: Duration,
    grace_period: Duration,
  ) -> Self {
    if poll_interval < MIN_POLL_INTERVAL {
      warn!(
        requested_ms = poll_interval.as_millis() as u64,
        "poll interval too short, using 1s"
      );
    }
    Self {
      service,
      transport,
      poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
      grace_period,
    }
  }

  pub fn spawn(self) -> MonitorHandle {
    let (events, rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());
    let task = tokio::spawn(self.run(rx, Arc::clone(&shutdown)));

    MonitorHandle {
      events,
      shutdown,
      task,
    }
  }

  async fn run(self, mut rx: mpsc::UnboundedReceiver<ConnectivityEvent>, shutdown: Arc<Notify>) {
    info!(
      poll_secs = self.poll_interval.as_secs(),
      grace_ms = self.grace_period.as_millis() as u64,
      "connectivity monitor started"
    );

    let grace = tokio::time::sleep(self.grace_period);
    tokio::pin!(grace);
    let mut armed = false;

    // Settle the initial state before taking any pushed events
    let event = self.probe().await;
    self.apply(event, &mut armed, grace.as_mut());
    self.refresh_counts();

    let mut ticker = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = shutdown.notified() => {
          info!("connectivity monitor shutting down");
          break;
        }
        _ = ticker.tick() => {
          let event = self.probe().await;
          self.apply(event, &mut armed, grace.as_mut());
          self.refresh_counts();
        }
        Some(event) = rx.recv() => {
          self.apply(event, &mut armed, grace.as_mut());
        }
        () = &mut grace, if armed => {
          armed = false;
          self.trigger_sync();
        }
      }
    }
  }

  async fn probe(&self) -> ConnectivityEvent {
    match self.transport.probe().await {
      Ok(result) => ConnectivityEvent::Online {
        connection_type: Some(result.connection_type),
      },
      Err(e) => {
        debug!(error = %e, "probe failed");
        ConnectivityEvent::Offline
      }
    }
  }

  fn apply(&self, event: ConnectivityEvent, armed: &mut bool, grace: Pin<&mut Sleep>) {
    match event {
      ConnectivityEvent::Online { connection_type } => {
        let mut came_online = false;
        self
          .service
          .update_status(|s| came_online = s.mark_online(connection_type, now_millis()));

        if came_online {
          info!("connection restored");
          if !*armed {
            grace.reset(Instant::now() + self.grace_period);
            *armed = true;
          }
        }
      }
      ConnectivityEvent::Offline => {
        let mut went_offline = false;
        self
          .service
          .update_status(|s| went_offline = s.mark_offline());

        if went_offline {
          info!("connection lost");
        }
        if *armed {
          debug!("pending sync cancelled");
          *armed = false;
        }
      }
    }
  }

  fn trigger_sync(&self) {
    let service = Arc::clone(&self.service);
    tokio::spawn(async move {
      match service.sync().await {
        Ok(outcomes) => debug!(entries = outcomes.len(), "reconnection sync finished"),
        Err(SyncError::SyncInProgress) => debug!("sync already running"),
        Err(e) => warn!(error = %e, "reconnection sync failed"),
      }
    });
  }

  fn refresh_counts(&self) {
    if let Err(e) = self.service.refresh_counts() {
      warn!(error = %e, "failed to refresh pending count");
    }
  }
}

use std::{sync::Arc, time::Duration};
use dashmap::DashMap;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use tungstenite::Message;

use crate::server::{
    connection::ConnectionHandle,
    health::HealthMetrics,
    message::{ClientId, ServerMessage},
};

#[derive(Debug)]
struct LivenessRecord {
    handle: ConnectionHandle,
    alive: bool,
}

/// Per-connection liveness flags, independent of room membership.
#[derive(Debug, Default)]
pub struct LivenessTable {
    records: DashMap<ClientId, LivenessRecord>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a freshly opened connection as alive.
    pub fn register(&self, id: ClientId, handle: ConnectionHandle) {
        self.records.insert(id, LivenessRecord { handle, alive: true });
    }

    /// Marks a connection alive. Called on every inbound frame.
    pub fn touch(&self, id: &ClientId) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.alive = true;
        }
    }

    pub fn remove(&self, id: &ClientId) {
        self.records.remove(id);
    }

    /// Stops tracking and terminates one connection. Returns whether it was tracked.
    pub fn terminate(&self, id: &ClientId) -> bool {
        match self.records.remove(id) {
            Some((_, record)) => {
                record.handle.terminate();
                true
            }
            None => false,
        }
    }

    /// Terminates every tracked connection.
    pub fn terminate_all(&self) {
        let ids: Vec<ClientId> = self.records.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.terminate(&id);
        }
    }

    pub fn is_alive(&self, id: &ClientId) -> Option<bool> {
        self.records.get(id).map(|r| r.alive)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Periodically probes every connection and reaps the silent ones.
pub struct HeartbeatMonitor {
    table: Arc<LivenessTable>,
    interval: Duration,
    metrics: Option<HealthMetrics>,
}

impl HeartbeatMonitor {
    pub fn new(table: Arc<LivenessTable>, interval: Duration) -> Self {
        Self { table, interval, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: HealthMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs one heartbeat pass.
    ///
    /// Every connection that has not been heard from since the previous pass
    /// is terminated; all others are flagged not-alive and sent a `ping`.
    /// Every dead connection found is reaped in the same pass.
    /// Returns the ids that were terminated.
    pub fn tick(&self) -> Vec<ClientId> {
        let ping = match Message::try_from(&ServerMessage::Ping) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode ping: {}", e);
                return Vec::new();
            }
        };

        let mut dead = Vec::new();
        for mut record in self.table.records.iter_mut() {
            if !record.alive {
                dead.push(record.key().clone());
                continue;
            }
            record.alive = false;
            if let Err(e) = record.handle.send_frame(ping.clone()) {
                debug!(client = %record.key(), "Ping not delivered: {}", e);
            }
        }

        for id in &dead {
            warn!(client = %id, "No heartbeat reply, terminating");
            self.table.terminate(id);
        }

        if let Some(metrics) = &self.metrics {
            metrics.connections_reaped.inc_by(dead.len() as u64);
        }
        dead
    }

    /// Ticks forever at the configured interval.
    #[instrument(skip(self), fields(interval_ms = self.interval.as_millis() as u64))]
    pub async fn run(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        info!("Heartbeat monitor started");

        loop {
            ticker.tick().await;
            let reaped = self.tick();
            if !reaped.is_empty() {
                debug!("Reaped {} connection(s)", reaped.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responsive_connection_survives() {
        let table = Arc::new(LivenessTable::new());
        let monitor = HeartbeatMonitor::new(table.clone(), Duration::from_secs(30));
        let (handle, mut rx) = ConnectionHandle::channel();
        let id = ClientId::from("a");
        table.register(id.clone(), handle.clone());

        assert!(monitor.tick().is_empty());
        assert_eq!(rx.try_recv().unwrap(), Message::Text(r#"{"type":"ping"}"#.into()));
        assert_eq!(table.is_alive(&id), Some(false));

        table.touch(&id);
        assert!(monitor.tick().is_empty());
        assert!(handle.is_open());
    }

    #[test]
    fn silent_connection_is_terminated_on_next_tick() {
        let table = Arc::new(LivenessTable::new());
        let monitor = HeartbeatMonitor::new(table.clone(), Duration::from_secs(30));
        let (handle, _rx) = ConnectionHandle::channel();
        let id = ClientId::from("a");
        table.register(id.clone(), handle.clone());

        monitor.tick();
        assert_eq!(monitor.tick(), vec![id.clone()]);
        assert!(!handle.is_open());
        assert_eq!(table.is_alive(&id), None);
    }

    #[test]
    fn all_dead_connections_are_reaped_in_one_tick() {
        let table = Arc::new(LivenessTable::new());
        let monitor = HeartbeatMonitor::new(table.clone(), Duration::from_secs(30));
        let mut handles = Vec::new();
        for id in ["a", "b", "c"] {
            let (handle, rx) = ConnectionHandle::channel();
            table.register(id.into(), handle.clone());
            handles.push((handle, rx));
        }

        monitor.tick();
        table.touch(&"b".into());
        let mut reaped = monitor.tick();
        reaped.sort();

        assert_eq!(reaped, vec![ClientId::from("a"), ClientId::from("c")]);
        assert_eq!(table.len(), 1);
        assert!(handles[1].0.is_open());
    }

    #[test]
    fn reaping_is_counted() {
        let table = Arc::new(LivenessTable::new());
        let metrics = HealthMetrics::new().unwrap();
        let monitor = HeartbeatMonitor::new(table.clone(), Duration::from_secs(30))
            .with_metrics(metrics.clone());
        let (handle, _rx) = ConnectionHandle::channel();
        table.register("a".into(), handle);

        monitor.tick();
        monitor.tick();
        assert_eq!(metrics.connections_reaped.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reaps_after_one_silent_interval() {
        let table = Arc::new(LivenessTable::new());
        let (handle, _rx) = ConnectionHandle::channel();
        table.register("a".into(), handle.clone());

        let task = tokio::spawn(HeartbeatMonitor::new(table.clone(), Duration::from_millis(100)).run());
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(table.is_empty());
        assert!(!handle.is_open());
        task.abort();
    }
}

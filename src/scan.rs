use std::collections::HashSet;

use log::{debug, trace};
use tokio::sync::{mpsc, oneshot};

use crate::ScannedDevice;

enum Command {
    StartScan,
    ScanFound(ScannedDevice),
    EndScan {
        reply: oneshot::Sender<HashSet<ScannedDevice>>,
    },
    CurrentlyFound {
        reply: oneshot::Sender<HashSet<ScannedDevice>>,
    },
    PreviouslyFound {
        reply: oneshot::Sender<Option<HashSet<ScannedDevice>>>,
    },
}

/// Accumulates the devices found during a discovery window.
///
/// All state lives on a single task spawned by `new()`; every operation is
/// submitted as a command and processed strictly in submission order, so
/// discovery broadcasts delivered concurrently with scan start/end can't
/// lose updates. Devices are deduplicated on their `(name, address)` key.
#[derive(Clone)]
pub struct ScanTracker {
    commands: mpsc::UnboundedSender<Command>,
}

impl ScanTracker {
    pub fn new() -> Self {
        let (commands, mut command_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut found: HashSet<ScannedDevice> = HashSet::new();
            let mut previous: Option<HashSet<ScannedDevice>> = None;
            while let Some(command) = command_rx.recv().await {
                match command {
                    Command::StartScan => {
                        found.clear();
                    }
                    Command::ScanFound(device) => {
                        if found.contains(&device) {
                            debug!("Dropping redundant scan result for {:?}", device);
                        } else {
                            debug!("Scan found {:?}, {} found so far", device, found.len() + 1);
                            found.insert(device);
                        }
                    }
                    Command::EndScan { reply } => {
                        let snapshot = std::mem::take(&mut found);
                        previous = Some(snapshot.clone());
                        let _ = reply.send(snapshot);
                    }
                    Command::CurrentlyFound { reply } => {
                        let _ = reply.send(found.clone());
                    }
                    Command::PreviouslyFound { reply } => {
                        let _ = reply.send(previous.clone());
                    }
                }
            }
            trace!("Exiting scan tracker task since the tracker has been dropped");
        });

        Self { commands }
    }

    /// Clears the accumulating set at the start of a new discovery window.
    pub fn start_scan(&self) {
        let _ = self.commands.send(Command::StartScan);
    }

    /// Records a device found by the current scan; redundant finds for the
    /// same `(name, address)` key are dropped.
    pub fn scan_found(&self, device: ScannedDevice) {
        let _ = self.commands.send(Command::ScanFound(device));
    }

    /// Atomically snapshots and clears the current set, remembering the
    /// snapshot as the previous scan's result.
    pub async fn end_scan(&self) -> HashSet<ScannedDevice> {
        self.request(|reply| Command::EndScan { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn currently_found(&self) -> HashSet<ScannedDevice> {
        self.request(|reply| Command::CurrentlyFound { reply })
            .await
            .unwrap_or_default()
    }

    /// The result set of the last completed scan, if any scan has completed.
    pub async fn previously_found(&self) -> Option<HashSet<ScannedDevice>> {
        self.request(|reply| Command::PreviouslyFound { reply })
            .await
            .unwrap_or_default()
    }

    async fn request<V>(&self, make: impl FnOnce(oneshot::Sender<V>) -> Command) -> Option<V> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(make(reply_tx)).is_err() {
            return None;
        }
        reply_rx.await.ok()
    }
}

impl Default for ScanTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::fake_device;

    #[tokio::test]
    async fn identical_devices_are_deduplicated() {
        let tracker = ScanTracker::new();
        tracker.start_scan();
        // Same (name, address) key but distinct platform handles
        let d1 = fake_device("Nintendo RVL-CNT-01", "00:1F:32:98:12:AB", 1);
        let d2 = fake_device("Nintendo RVL-CNT-01", "00:1F:32:98:12:AB", 2);
        tracker.scan_found(d1.clone());
        tracker.scan_found(d2);

        let found = tracker.currently_found().await;
        assert_eq!(found.len(), 1);
        assert!(found.contains(&d1));
    }

    #[tokio::test]
    async fn end_scan_snapshots_and_clears() {
        let tracker = ScanTracker::new();
        tracker.start_scan();
        let d1 = fake_device("Nintendo RVL-CNT-01", "00:1F:32:98:12:AB", 1);
        let d2 = fake_device("Nintendo RVL-CNT-01-TR", "00:1F:32:98:12:AC", 2);
        tracker.scan_found(d1.clone());
        tracker.scan_found(d2.clone());

        let snapshot = tracker.end_scan().await;
        assert_eq!(snapshot.len(), 2);
        assert!(tracker.currently_found().await.is_empty());
        assert_eq!(tracker.previously_found().await, Some(snapshot));
    }

    #[tokio::test]
    async fn no_previous_results_before_first_scan_completes() {
        let tracker = ScanTracker::new();
        tracker.start_scan();
        tracker.scan_found(fake_device("Nintendo RVL-CNT-01", "00:1F:32:98:12:AB", 1));
        assert_eq!(tracker.previously_found().await, None);
    }

    #[tokio::test]
    async fn starting_a_new_scan_clears_stale_results() {
        let tracker = ScanTracker::new();
        tracker.start_scan();
        tracker.scan_found(fake_device("Nintendo RVL-CNT-01", "00:1F:32:98:12:AB", 1));
        tracker.start_scan();
        assert!(tracker.currently_found().await.is_empty());
    }
}

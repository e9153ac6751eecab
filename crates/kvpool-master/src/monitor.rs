//! Client liveness monitor (HA mode).
//!
//! Request handlers signal pings through a bounded queue; the monitor
//! thread owns the deadline map. Expired clients are dropped from
//! `ok_clients` and every segment they own goes through the same
//! two-phase unmount as an explicit UnmountSegment. The client and
//! segment locks are released before the metadata sweep so the sweep
//! never blocks an in-flight PutStart.

use crate::service::MasterInner;
use kvpool_common::{ClientId, SegmentId};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Sleep between monitor ticks
pub(crate) const MONITOR_SLEEP_MS: u64 = 100;

/// Bound on undrained ping signals. Sized for a few pings per client
/// between ticks; overflow turns into INTERNAL_ERROR at the caller.
pub(crate) const PING_QUEUE_CAPACITY: usize = 4096;

impl MasterInner {
    /// Monitor thread body. Runs until the service shuts down.
    pub(crate) fn monitor_loop(&self) {
        debug!("client monitor thread started");
        let ttl = Duration::from_secs(self.config.client_live_ttl_secs);
        let mut client_ttl: HashMap<ClientId, Instant> = HashMap::new();

        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            while let Some(client_id) = self.ping_queue.pop() {
                client_ttl.insert(client_id, now + ttl);
            }

            let expired: Vec<ClientId> = client_ttl
                .iter()
                .filter(|(_, &deadline)| deadline < now)
                .map(|(&client_id, _)| client_id)
                .collect();
            for client_id in &expired {
                client_ttl.remove(client_id);
                info!(client_id = %client_id, "client expired");
            }

            if !expired.is_empty() {
                self.unmount_expired_clients(&expired);
            }

            std::thread::sleep(Duration::from_millis(MONITOR_SLEEP_MS));
        }
        debug!("client monitor thread stopped");
    }

    /// Reclaim every segment owned by the expired clients.
    fn unmount_expired_clients(&self, expired: &[ClientId]) {
        // (segment, name, owner, capacity to release at commit)
        let mut prepared: Vec<(SegmentId, String, ClientId, u64)> = Vec::new();

        // Lock order: client write-lock, then segment write-lock. Both
        // are released before the shard sweep below.
        {
            let mut ok_clients = self.ok_clients.write();
            for client_id in expired {
                if ok_clients.remove(client_id) {
                    self.metrics.dec_active_clients();
                }
            }

            let mut access = self.segments.segment_access();
            for client_id in expired {
                for segment in access.client_segments(*client_id) {
                    match access.prepare_unmount(segment.id, *client_id) {
                        Ok(dec_capacity) => {
                            prepared.push((segment.id, segment.name, *client_id, dec_capacity));
                        }
                        Err(e) => {
                            error!(
                                client_id = %client_id,
                                segment_name = %segment.name,
                                error = %e,
                                "prepare unmount of expired client segment failed"
                            );
                        }
                    }
                }
            }
        }

        if prepared.is_empty() {
            return;
        }

        self.store.clear_invalid_handles();

        let mut access = self.segments.segment_access();
        for (segment_id, segment_name, client_id, dec_capacity) in prepared {
            access.commit_unmount(segment_id, client_id, dec_capacity);
            info!(
                client_id = %client_id,
                segment_name = %segment_name,
                "unmounted expired client segment"
            );
        }
    }
}

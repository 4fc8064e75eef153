//! In-memory tunnel registry
//!
//! One entry per endpoint, created lazily on first access and never deleted,
//! only reset to idle. The registry is the single synchronization point for
//! tunnel state; the lifecycle manager performs every mutation.

use fleetgate_types::{EdgeJob, EndpointId, TunnelStatus};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Point-in-time view of one endpoint's tunnel.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub endpoint_id: EndpointId,
    pub status: TunnelStatus,
    /// Loopback forwarding port. Non-zero exactly while the tunnel is
    /// activating or active.
    pub port: u16,
    pub last_activity: Instant,
    /// Jobs pending delivery to the endpoint's agent.
    pub jobs: Vec<EdgeJob>,
}

#[derive(Debug)]
struct Entry {
    status: TunnelStatus,
    port: u16,
    last_activity: Instant,
    jobs: Vec<EdgeJob>,
}

impl Entry {
    fn idle() -> Self {
        Self {
            status: TunnelStatus::Idle,
            port: 0,
            last_activity: Instant::now(),
            jobs: Vec::new(),
        }
    }
}

/// Registry of tunnel state for every known endpoint.
#[derive(Default)]
pub struct TunnelRegistry {
    inner: RwLock<HashMap<EndpointId, Entry>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the endpoint's tunnel, creating an idle entry if absent.
    pub async fn details(&self, endpoint_id: EndpointId) -> Tunnel {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(endpoint_id).or_insert_with(Entry::idle);
        Tunnel {
            endpoint_id,
            status: entry.status,
            port: entry.port,
            last_activity: entry.last_activity,
            jobs: entry.jobs.clone(),
        }
    }

    /// Refresh the idle clock without touching status.
    pub async fn touch(&self, endpoint_id: EndpointId) {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(endpoint_id).or_insert_with(Entry::idle);
        entry.last_activity = Instant::now();
    }

    /// Refresh the idle clock and promote an activating tunnel to active.
    ///
    /// An idle tunnel stays idle: it has no bound port, so promoting it
    /// would break the port/status invariant. Traffic always goes through
    /// activation first.
    pub async fn set_active(&self, endpoint_id: EndpointId) {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(endpoint_id).or_insert_with(Entry::idle);
        if matches!(
            entry.status,
            TunnelStatus::Activating | TunnelStatus::Active
        ) {
            entry.status = TunnelStatus::Active;
        }
        entry.last_activity = Instant::now();
    }

    /// Transition Idle → Activating, recording the reserved loopback port.
    pub(crate) async fn begin_activation(
        &self,
        endpoint_id: EndpointId,
        port: u16,
    ) -> Result<(), crate::TunnelError> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(endpoint_id).or_insert_with(Entry::idle);
        match entry.status {
            TunnelStatus::Idle => {
                entry.status = TunnelStatus::Activating;
                entry.port = port;
                entry.last_activity = Instant::now();
                Ok(())
            }
            _ => Err(crate::TunnelError::AlreadyActivating(endpoint_id)),
        }
    }

    /// Transition Activating → Active. Returns false if the tunnel left the
    /// activating state in the meantime (reaped or agent disconnected).
    pub(crate) async fn complete_activation(&self, endpoint_id: EndpointId) -> bool {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(endpoint_id).or_insert_with(Entry::idle);
        if entry.status == TunnelStatus::Activating {
            entry.status = TunnelStatus::Active;
            entry.last_activity = Instant::now();
            true
        } else {
            false
        }
    }

    /// Transition to Closing, dropping the port. Returns whether the tunnel
    /// was activating or active.
    pub(crate) async fn mark_closing(&self, endpoint_id: EndpointId) -> bool {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(endpoint_id).or_insert_with(Entry::idle);
        let was_open = matches!(
            entry.status,
            TunnelStatus::Activating | TunnelStatus::Active
        );
        if was_open {
            entry.status = TunnelStatus::Closing;
            entry.port = 0;
        }
        was_open
    }

    /// Reset to Idle after cleanup (or a failed activation).
    pub(crate) async fn reset(&self, endpoint_id: EndpointId) {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(endpoint_id).or_insert_with(Entry::idle);
        entry.status = TunnelStatus::Idle;
        entry.port = 0;
        entry.last_activity = Instant::now();
    }

    /// Merge a job into the endpoint's pending set, idempotent per job id.
    pub async fn add_job(&self, endpoint_id: EndpointId, job: EdgeJob) {
        let mut inner = self.inner.write().await;
        let entry = inner.entry(endpoint_id).or_insert_with(Entry::idle);
        if let Some(existing) = entry.jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job;
        } else {
            entry.jobs.push(job);
        }
    }

    /// Jobs pending delivery to the endpoint's agent.
    pub async fn jobs(&self, endpoint_id: EndpointId) -> Vec<EdgeJob> {
        let inner = self.inner.read().await;
        inner
            .get(&endpoint_id)
            .map(|entry| entry.jobs.clone())
            .unwrap_or_default()
    }

    /// Active tunnels whose last activity is older than `threshold`.
    pub(crate) async fn stale_active(&self, threshold: Duration) -> Vec<EndpointId> {
        let inner = self.inner.read().await;
        inner
            .iter()
            .filter(|(_, entry)| {
                entry.status == TunnelStatus::Active && entry.last_activity.elapsed() > threshold
            })
            .map(|(endpoint_id, _)| *endpoint_id)
            .collect()
    }

    /// Snapshot of every known tunnel, for status views.
    pub async fn snapshot(&self) -> Vec<Tunnel> {
        let inner = self.inner.read().await;
        inner
            .iter()
            .map(|(endpoint_id, entry)| Tunnel {
                endpoint_id: *endpoint_id,
                status: entry.status,
                port: entry.port,
                last_activity: entry.last_activity,
                jobs: entry.jobs.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgate_types::{EdgeJobId, TunnelStatus};
    use std::collections::HashMap as StdHashMap;

    fn job(id: u32, cron: &str) -> EdgeJob {
        EdgeJob {
            id: EdgeJobId(id),
            cron_expression: cron.to_string(),
            script_path: format!("jobs/{}/script", id),
            endpoints: StdHashMap::new(),
        }
    }

    fn assert_port_invariant(tunnel: &Tunnel) {
        let open = matches!(
            tunnel.status,
            TunnelStatus::Activating | TunnelStatus::Active
        );
        assert_eq!(
            tunnel.port != 0,
            open,
            "port {} does not match status {:?}",
            tunnel.port,
            tunnel.status
        );
    }

    #[tokio::test]
    async fn test_details_creates_idle_entry() {
        let registry = TunnelRegistry::new();
        let tunnel = registry.details(EndpointId(1)).await;

        assert_eq!(tunnel.status, TunnelStatus::Idle);
        assert_eq!(tunnel.port, 0);
        assert!(tunnel.jobs.is_empty());
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_port_invariant_across_lifecycle() {
        let registry = TunnelRegistry::new();
        let id = EndpointId(2);

        assert_port_invariant(&registry.details(id).await);

        registry.begin_activation(id, 45100).await.unwrap();
        assert_port_invariant(&registry.details(id).await);
        assert_eq!(registry.details(id).await.status, TunnelStatus::Activating);

        assert!(registry.complete_activation(id).await);
        assert_port_invariant(&registry.details(id).await);
        assert_eq!(registry.details(id).await.port, 45100);

        assert!(registry.mark_closing(id).await);
        assert_port_invariant(&registry.details(id).await);

        registry.reset(id).await;
        let tunnel = registry.details(id).await;
        assert_eq!(tunnel.status, TunnelStatus::Idle);
        assert_eq!(tunnel.port, 0);
    }

    #[tokio::test]
    async fn test_begin_activation_rejects_non_idle() {
        let registry = TunnelRegistry::new();
        let id = EndpointId(3);

        registry.begin_activation(id, 45101).await.unwrap();
        let err = registry.begin_activation(id, 45102).await.unwrap_err();
        assert!(matches!(err, crate::TunnelError::AlreadyActivating(e) if e == id));
    }

    #[tokio::test]
    async fn test_complete_activation_fails_after_reset() {
        let registry = TunnelRegistry::new();
        let id = EndpointId(4);

        registry.begin_activation(id, 45103).await.unwrap();
        registry.reset(id).await;
        assert!(!registry.complete_activation(id).await);
        assert_eq!(registry.details(id).await.status, TunnelStatus::Idle);
    }

    #[tokio::test]
    async fn test_set_active_does_not_promote_idle() {
        let registry = TunnelRegistry::new();
        let id = EndpointId(5);

        registry.set_active(id).await;
        let tunnel = registry.details(id).await;
        assert_eq!(tunnel.status, TunnelStatus::Idle);
        assert_eq!(tunnel.port, 0);
    }

    #[tokio::test]
    async fn test_add_job_is_idempotent_per_id() {
        let registry = TunnelRegistry::new();
        let id = EndpointId(6);

        registry.add_job(id, job(1, "@hourly")).await;
        registry.add_job(id, job(2, "@daily")).await;
        registry.add_job(id, job(1, "*/10 * * * *")).await;

        let jobs = registry.jobs(id).await;
        assert_eq!(jobs.len(), 2);
        let updated = jobs.iter().find(|j| j.id == EdgeJobId(1)).unwrap();
        assert_eq!(updated.cron_expression, "*/10 * * * *");
    }

    #[tokio::test]
    async fn test_stale_active_only_reports_stale_actives() {
        let registry = TunnelRegistry::new();
        let stale = EndpointId(7);
        let fresh = EndpointId(8);
        let idle = EndpointId(9);

        registry.begin_activation(stale, 45104).await.unwrap();
        registry.complete_activation(stale).await;
        registry.begin_activation(fresh, 45105).await.unwrap();
        registry.complete_activation(fresh).await;
        registry.details(idle).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.touch(fresh).await;

        let candidates = registry.stale_active(Duration::from_millis(20)).await;
        assert_eq!(candidates, vec![stale]);
    }
}

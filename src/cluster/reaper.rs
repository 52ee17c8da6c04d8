//! Background sweep that deletes pods nobody has used for a while.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use super::control::PodInfo;
use super::provisioner::Provisioner;

/// Names of pods whose last use is more than `idle_timeout_secs` before `now`.
///
/// Pods without a usable `last-used-ts` (still starting, or annotated by hand)
/// are kept.
pub fn idle_candidates(pods: &[PodInfo], now: i64, idle_timeout_secs: u64) -> Vec<String> {
    let idle = i64::try_from(idle_timeout_secs).unwrap_or(i64::MAX);
    pods.iter()
        .filter(|pod| pod.last_used().is_some_and(|ts| now.saturating_sub(ts) > idle))
        .map(|pod| pod.name.clone())
        .collect()
}

/// Run [`Provisioner::cleanup_idle`] every `period` until the runtime stops.
pub fn spawn_idle_reaper(provisioner: Arc<Provisioner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match provisioner.cleanup_idle().await {
                Ok(report) if report.count > 0 => {
                    info!(count = report.count, pods = ?report.deleted, "reaped idle sandboxes")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "idle sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::control::PodPhase;
    use crate::cluster::ANNOTATION_LAST_USED;
    use std::collections::BTreeMap;

    fn pod(name: &str, last_used: Option<&str>) -> PodInfo {
        let mut annotations = BTreeMap::new();
        if let Some(ts) = last_used {
            annotations.insert(ANNOTATION_LAST_USED.to_string(), ts.to_string());
        }
        PodInfo {
            name: name.into(),
            phase: PodPhase::Running,
            ready: true,
            deleting: false,
            annotations,
        }
    }

    #[test]
    fn test_idle_boundary() {
        let now = 10_000;
        let pods = vec![
            pod("exactly", Some("8200")),
            pod("one-over", Some("8199")),
            pod("fresh", Some("9999")),
        ];
        assert_eq!(idle_candidates(&pods, now, 1800), vec!["one-over"]);
    }

    #[test]
    fn test_unstamped_pods_survive() {
        let pods = vec![pod("starting", None), pod("garbage", Some("soon")), pod("zero", Some("0"))];
        assert!(idle_candidates(&pods, i64::MAX, 1).is_empty());
    }

    #[test]
    fn test_fractional_timestamps() {
        let pods = vec![pod("p", Some("100.9"))];
        assert_eq!(idle_candidates(&pods, 201, 100), vec!["p"]);
        assert!(idle_candidates(&pods, 200, 100).is_empty());
    }
}

//! Status Reconciler
//!
//! Waits for freshly launched instances to reach `running` with at least one
//! internal address, merging every observation into the Node State Table.
//!
//! When the back-end offers a native waiter it is used first; the manual
//! describe loop then runs to pick up addresses (normally converging on its
//! first probe). Every wait is bounded by `instance_poll`.

use std::collections::BTreeSet;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use autok3s_common::retry::{poll_until, PollConfig, PollError, Probe};
use autok3s_common::{Error, InstanceStatus, Result};

use crate::backend::InstanceQuery;
use crate::describe::{list_instances, observation};
use crate::Session;

/// Overall budget handed to a native waiter
fn native_wait_timeout(poll: &PollConfig) -> Duration {
    poll.interval.saturating_mul(poll.max_attempts)
}

/// Wait until every instance in `ids` is running with an internal address
#[instrument(skip(session), fields(cluster = %session.ctx))]
pub async fn wait_running(session: &Session, ids: &[String]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    let poll = session.config.instance_poll.to_poll_config();

    if session.cloud.capabilities().native_wait {
        let timeout = native_wait_timeout(&poll);
        match session.cloud.wait_instances_running(ids, timeout).await {
            Ok(true) => debug!(count = ids.len(), "Native waiter reported running"),
            Ok(false) => {
                warn!(instances = ?ids, "Native waiter timed out");
                return Err(Error::ConvergenceTimeout {
                    cluster: session.cluster(),
                    target: InstanceStatus::Running.to_string(),
                    pending: ids.to_vec(),
                    attempts: poll.max_attempts,
                });
            }
            // Fall back to describing; the manual loop has its own bound
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Native waiter failed, polling manually")
            }
            Err(e) => return Err(e),
        }
    }

    let pending = Mutex::new(ids.iter().cloned().collect::<BTreeSet<String>>());
    let pending_ref = &pending;

    let result = poll_until(&poll, "wait_instances_running", move |attempt| async move {
        let waiting: Vec<String> = pending_ref.lock().iter().cloned().collect();
        if waiting.is_empty() {
            return Ok(Probe::Ready(()));
        }

        let instances = match list_instances(session, &InstanceQuery::by_ids(waiting)).await {
            Ok(instances) => instances,
            Err(e) if e.is_retryable() => {
                debug!(attempt, error = %e, "Describe failed, will poll again");
                return Ok(Probe::Pending);
            }
            Err(e) => return Err(e),
        };

        for instance in instances {
            if !pending_ref.lock().contains(&instance.instance_id) {
                continue;
            }
            if instance.status.is_gone() {
                return Err(Error::provider_permanent(
                    session.cluster(),
                    session.provider(),
                    format!(
                        "instance {} entered {} while waiting for running",
                        instance.instance_id, instance.status
                    ),
                ));
            }

            let ready =
                instance.status == InstanceStatus::Running && !instance.internal_addresses.is_empty();
            let id = instance.instance_id.clone();
            session.table.upsert(observation(instance));
            if ready {
                pending_ref.lock().remove(&id);
                debug!(instance_id = %id, attempt, "Instance running");
            }
        }

        if pending_ref.lock().is_empty() {
            Ok(Probe::Ready(()))
        } else {
            Ok(Probe::Pending)
        }
    })
    .await;

    match result {
        Ok(()) => {
            info!(count = ids.len(), "Instances running");
            Ok(())
        }
        Err(PollError::Failed(e)) => Err(e),
        Err(PollError::Exhausted { attempts }) => {
            let pending: Vec<String> = pending.lock().iter().cloned().collect();
            warn!(instances = ?pending, attempts, "Instances did not reach running");
            Err(Error::ConvergenceTimeout {
                cluster: session.cluster(),
                target: InstanceStatus::Running.to_string(),
                pending,
                attempts,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Capabilities, InstanceDescription, InstancePage, MockCloudApi};
    use autok3s_common::{ClusterContext, EngineConfig, NodeRecord, ProviderKind, Role};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ctx() -> ClusterContext {
        ClusterContext::new("demo", "ap-guangzhou", ProviderKind::Tencent)
    }

    fn mock(capabilities: fn() -> Capabilities) -> MockCloudApi {
        let mut cloud = MockCloudApi::new();
        cloud.expect_provider().return_const(ProviderKind::Tencent);
        cloud.expect_capabilities().returning(capabilities);
        cloud
    }

    fn seeded(cloud: MockCloudApi, ids: &[&str]) -> Session {
        let session = Session::new(Arc::new(cloud), ctx(), EngineConfig::fast());
        for id in ids {
            session
                .table
                .upsert(NodeRecord::fresh(*id, Role::Worker, InstanceStatus::Pending));
        }
        session
    }

    fn running(id: &str) -> InstanceDescription {
        InstanceDescription {
            instance_id: id.to_string(),
            status: InstanceStatus::Running,
            internal_addresses: vec![format!("10.0.1.{}", id.len())],
            ..Default::default()
        }
    }

    fn pending(id: &str) -> InstanceDescription {
        InstanceDescription {
            instance_id: id.to_string(),
            status: InstanceStatus::Pending,
            ..Default::default()
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    // ==========================================================================
    // Story: Manual Polling
    // ==========================================================================

    #[tokio::test]
    async fn instances_converge_after_a_few_probes() {
        let probes = Arc::new(AtomicUsize::new(0));
        let probes_clone = probes.clone();

        let mut cloud = mock(Capabilities::tencent);
        cloud.expect_describe_instances().returning(move |query, _| {
            let n = probes_clone.fetch_add(1, Ordering::SeqCst);
            let instances = query
                .instance_ids
                .iter()
                .map(|id| if n < 2 { pending(id) } else { running(id) })
                .collect();
            Ok(InstancePage {
                instances,
                next: None,
            })
        });

        let session = seeded(cloud, &["i-1", "i-2"]);
        wait_running(&session, &ids(&["i-1", "i-2"])).await.unwrap();

        assert_eq!(probes.load(Ordering::SeqCst), 3);
        for record in session.table.records() {
            assert!(record.is_ready());
            assert_eq!(record.role, Some(Role::Worker), "role survives the merge");
            assert!(record.is_current());
        }
    }

    /// Running without an address is not converged
    #[tokio::test]
    async fn running_without_address_keeps_polling() {
        let mut cloud = mock(Capabilities::tencent);
        cloud.expect_describe_instances().returning(|_, _| {
            let mut instance = running("i-1");
            instance.internal_addresses.clear();
            Ok(InstancePage {
                instances: vec![instance],
                next: None,
            })
        });

        let session = seeded(cloud, &["i-1"]);
        let err = wait_running(&session, &ids(&["i-1"])).await.unwrap_err();

        assert!(matches!(err, Error::ConvergenceTimeout { .. }));
        assert_eq!(
            session.table.get("i-1").unwrap().status,
            InstanceStatus::Pending,
            "running is only published together with an address"
        );
    }

    /// Scenario: two workers, one never reaches running
    #[tokio::test]
    async fn when_one_instance_times_out_only_it_is_reported() {
        let mut cloud = mock(Capabilities::tencent);
        cloud.expect_describe_instances().returning(|query, _| {
            let instances = query
                .instance_ids
                .iter()
                .map(|id| if id == "i-slow" { pending(id) } else { running(id) })
                .collect();
            Ok(InstancePage {
                instances,
                next: None,
            })
        });

        let session = seeded(cloud, &["i-fast", "i-slow"]);
        let err = wait_running(&session, &ids(&["i-fast", "i-slow"]))
            .await
            .unwrap_err();

        match err {
            Error::ConvergenceTimeout {
                pending, attempts, ..
            } => {
                assert_eq!(pending, vec!["i-slow".to_string()]);
                assert_eq!(attempts, 10);
            }
            other => panic!("expected ConvergenceTimeout, got {other:?}"),
        }
        assert!(session.table.get("i-fast").unwrap().is_ready());
    }

    #[tokio::test]
    async fn terminated_instance_fails_fast() {
        let mut cloud = mock(Capabilities::tencent);
        cloud.expect_describe_instances().times(1).returning(|_, _| {
            let mut instance = pending("i-1");
            instance.status = InstanceStatus::Terminated;
            Ok(InstancePage {
                instances: vec![instance],
                next: None,
            })
        });

        let session = seeded(cloud, &["i-1"]);
        let err = wait_running(&session, &ids(&["i-1"])).await.unwrap_err();
        assert!(err.to_string().contains("terminated"));
    }

    #[tokio::test]
    async fn transient_describe_errors_are_polled_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mut cloud = mock(Capabilities::tencent);
        cloud.expect_describe_instances().returning(move |_, _| {
            // Four failures outlast the per-call retry budget of three
            if calls_clone.fetch_add(1, Ordering::SeqCst) < 4 {
                Err(Error::provider("RequestLimitExceeded"))
            } else {
                Ok(InstancePage {
                    instances: vec![running("i-1")],
                    next: None,
                })
            }
        });

        let session = seeded(cloud, &["i-1"]);
        wait_running(&session, &ids(&["i-1"])).await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 5);
    }

    // ==========================================================================
    // Story: Native Waiter
    // ==========================================================================

    #[tokio::test]
    async fn native_waiter_is_followed_by_one_describe() {
        let mut cloud = mock(Capabilities::aws);
        cloud
            .expect_wait_instances_running()
            .times(1)
            .returning(|_, _| Ok(true));
        cloud.expect_describe_instances().times(1).returning(|_, _| {
            Ok(InstancePage {
                instances: vec![running("i-1")],
                next: None,
            })
        });

        let session = seeded(cloud, &["i-1"]);
        wait_running(&session, &ids(&["i-1"])).await.unwrap();
        assert!(session.table.get("i-1").unwrap().is_ready());
    }

    #[tokio::test]
    async fn native_waiter_timeout_is_a_convergence_timeout() {
        let mut cloud = mock(Capabilities::aws);
        cloud
            .expect_wait_instances_running()
            .returning(|_, _| Ok(false));
        cloud.expect_describe_instances().times(0);

        let session = seeded(cloud, &["i-1", "i-2"]);
        let err = wait_running(&session, &ids(&["i-1", "i-2"]))
            .await
            .unwrap_err();
        match err {
            Error::ConvergenceTimeout { pending, .. } => assert_eq!(pending.len(), 2),
            other => panic!("expected ConvergenceTimeout, got {other:?}"),
        }
    }

    #[test]
    fn native_wait_timeout_saturates_instead_of_overflowing() {
        let poll = PollConfig::fixed(60, Duration::from_millis(500));
        assert_eq!(native_wait_timeout(&poll), Duration::from_secs(30));

        let huge = PollConfig::fixed(u32::MAX, Duration::from_millis(u64::MAX));
        assert_eq!(native_wait_timeout(&huge), Duration::MAX);
    }

    #[tokio::test]
    async fn nothing_to_wait_for() {
        let mut cloud = mock(Capabilities::aws);
        cloud.expect_wait_instances_running().times(0);
        let session = seeded(cloud, &[]);
        wait_running(&session, &[]).await.unwrap();
    }
}

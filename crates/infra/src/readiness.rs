//! Broker readiness guard.
//!
//! Blocks consumer startup until the broker accepts connections, the command
//! topic exists, and a trial subscription gets a partition assignment. Every
//! attempt runs the full check sequence; a failure at any step schedules a
//! retry after a fixed interval.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{info, instrument};

/// Topic layout requested when the command topic has to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("broker unreachable at {address}: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("metadata request failed: {0}")]
    Metadata(String),

    #[error("topic creation failed: {0}")]
    CreateTopic(String),

    #[error("trial subscription failed: {0}")]
    Subscription(String),

    #[error("no partitions assigned for topic {0}")]
    NoAssignment(String),
}

/// The individual checks a readiness attempt is made of.
#[async_trait::async_trait]
pub trait BrokerProbe: Send + Sync {
    /// Raw network reachability of the bootstrap broker.
    async fn check_reachable(&self) -> Result<(), ProbeError>;

    /// Whether the broker's metadata lists `topic`.
    async fn topic_exists(&self, topic: &str) -> Result<bool, ProbeError>;

    /// Create the topic. A topic that already exists is not an error.
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), ProbeError>;

    /// Subscribe with a throwaway consumer and return how many partitions
    /// it was assigned.
    async fn trial_assignment(&self, topic: &str) -> Result<usize, ProbeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
    /// Pause after creating the topic so metadata reaches every broker.
    pub propagation_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            retry_interval: Duration::from_secs(5),
            propagation_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    /// 1-based attempt that passed.
    pub attempts: u32,
    /// Whether this guard created the topic.
    pub topic_created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("broker not ready after {attempts} attempts: {last_error}")]
pub struct Unavailable {
    pub attempts: u32,
    pub last_error: ProbeError,
}

pub struct ReadinessGuard<P> {
    probe: P,
    topic: TopicSpec,
    policy: ReadinessPolicy,
}

impl<P> ReadinessGuard<P>
where
    P: BrokerProbe,
{
    pub fn new(probe: P, topic: TopicSpec, policy: ReadinessPolicy) -> Self {
        Self {
            probe,
            topic,
            policy,
        }
    }

    pub fn policy(&self) -> &ReadinessPolicy {
        &self.policy
    }

    /// Retry the check sequence until it passes or attempts run out.
    #[instrument(skip(self), fields(topic = %self.topic.name, max_attempts = self.policy.max_attempts))]
    pub async fn await_ready(&self) -> Result<Ready, Unavailable> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut topic_created = false;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.attempt(&mut topic_created).await {
                Ok(partitions) => {
                    info!(attempt, partitions, topic_created, "broker ready");
                    return Ok(Ready {
                        attempts: attempt,
                        topic_created,
                    });
                }
                Err(err) => {
                    info!(attempt, max_attempts, error = %err, "broker not ready yet");
                    last_error = Some(err);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.retry_interval).await;
                    }
                }
            }
        }

        Err(Unavailable {
            attempts: max_attempts,
            last_error: last_error.unwrap_or_else(|| ProbeError::NoAssignment(self.topic.name.clone())),
        })
    }

    async fn attempt(&self, topic_created: &mut bool) -> Result<usize, ProbeError> {
        self.probe.check_reachable().await?;

        if !self.probe.topic_exists(&self.topic.name).await? {
            self.probe.create_topic(&self.topic).await?;
            *topic_created = true;
            info!(
                topic = %self.topic.name,
                partitions = self.topic.partitions,
                replication = self.topic.replication,
                "created command topic"
            );
            tokio::time::sleep(self.policy.propagation_delay).await;
        }

        let partitions = self.probe.trial_assignment(&self.topic.name).await?;
        if partitions == 0 {
            return Err(ProbeError::NoAssignment(self.topic.name.clone()));
        }
        Ok(partitions)
    }
}

/// Open (and immediately drop) a TCP connection to `address`.
pub async fn tcp_reachable(address: &str, timeout: Duration) -> Result<(), ProbeError> {
    let unreachable = |reason: String| ProbeError::Unreachable {
        address: address.to_string(),
        reason,
    };

    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(err)) => Err(unreachable(err.to_string())),
        Err(_) => Err(unreachable(format!("connect timed out after {timeout:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Probe whose broker comes up after `down_for` reachability checks.
    #[derive(Default)]
    struct ScriptedProbe {
        down_for: u32,
        topic_present: Mutex<bool>,
        empty_assignments: AtomicU32,
        metadata_failures: AtomicU32,
        create_failures: AtomicU32,
        reach_calls: AtomicU32,
        create_calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl BrokerProbe for ScriptedProbe {
        async fn check_reachable(&self) -> Result<(), ProbeError> {
            let call = self.reach_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.down_for {
                return Err(ProbeError::Unreachable {
                    address: "kafka:9092".to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        }

        async fn topic_exists(&self, _topic: &str) -> Result<bool, ProbeError> {
            if take_one(&self.metadata_failures) {
                return Err(ProbeError::Metadata("request timed out".to_string()));
            }
            Ok(*self.topic_present.lock().unwrap())
        }

        async fn create_topic(&self, _spec: &TopicSpec) -> Result<(), ProbeError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.create_failures) {
                return Err(ProbeError::CreateTopic("broker not available".to_string()));
            }
            *self.topic_present.lock().unwrap() = true;
            Ok(())
        }

        async fn trial_assignment(&self, _topic: &str) -> Result<usize, ProbeError> {
            let empty = self.empty_assignments.load(Ordering::SeqCst);
            if empty > 0 {
                self.empty_assignments.store(empty - 1, Ordering::SeqCst);
                return Ok(0);
            }
            Ok(1)
        }
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn topic() -> TopicSpec {
        TopicSpec {
            name: "products".to_string(),
            partitions: 1,
            replication: 1,
        }
    }

    fn fast_policy(max_attempts: u32) -> ReadinessPolicy {
        ReadinessPolicy {
            max_attempts,
            retry_interval: Duration::ZERO,
            propagation_delay: Duration::ZERO,
            connect_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn gives_up_after_exactly_max_attempts() {
        let probe = ScriptedProbe {
            down_for: u32::MAX,
            ..Default::default()
        };
        let guard = ReadinessGuard::new(probe, topic(), fast_policy(4));

        let err = guard.await_ready().await.unwrap_err();

        assert_eq!(err.attempts, 4);
        assert!(matches!(err.last_error, ProbeError::Unreachable { .. }));
        assert_eq!(guard.probe.reach_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn ready_as_soon_as_all_steps_pass() {
        let probe = ScriptedProbe {
            down_for: 2,
            ..Default::default()
        };
        let guard = ReadinessGuard::new(probe, topic(), fast_policy(30));

        let ready = guard.await_ready().await.unwrap();

        assert_eq!(ready, Ready { attempts: 3, topic_created: true });
        assert_eq!(guard.probe.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_topic_is_not_recreated() {
        let probe = ScriptedProbe {
            topic_present: Mutex::new(true),
            ..Default::default()
        };
        let guard = ReadinessGuard::new(probe, topic(), fast_policy(30));

        let ready = guard.await_ready().await.unwrap();

        assert_eq!(ready, Ready { attempts: 1, topic_created: false });
        assert_eq!(guard.probe.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_assignment_triggers_retry() {
        let probe = ScriptedProbe {
            topic_present: Mutex::new(true),
            empty_assignments: AtomicU32::new(1),
            ..Default::default()
        };
        let guard = ReadinessGuard::new(probe, topic(), fast_policy(30));

        let ready = guard.await_ready().await.unwrap();
        assert_eq!(ready.attempts, 2);
    }

    #[tokio::test]
    async fn metadata_failure_triggers_retry() {
        let probe = ScriptedProbe {
            topic_present: Mutex::new(true),
            metadata_failures: AtomicU32::new(1),
            ..Default::default()
        };
        let guard = ReadinessGuard::new(probe, topic(), fast_policy(30));

        let ready = guard.await_ready().await.unwrap();

        assert_eq!(ready, Ready { attempts: 2, topic_created: false });
    }

    #[tokio::test]
    async fn failed_topic_creation_is_retried() {
        let probe = ScriptedProbe {
            create_failures: AtomicU32::new(1),
            ..Default::default()
        };
        let guard = ReadinessGuard::new(probe, topic(), fast_policy(30));

        let ready = guard.await_ready().await.unwrap();

        assert_eq!(ready, Ready { attempts: 2, topic_created: true });
        assert_eq!(guard.probe.create_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tcp_probe_reports_listener_state() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tcp_reachable(&address, Duration::from_secs(1)).await.unwrap();

        drop(listener);
        let err = tcp_reachable(&address, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Unreachable { .. }));
    }
}

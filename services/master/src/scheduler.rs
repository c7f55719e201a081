//! Proposal evaluation and the binding table.
//!
//! Each proposal is evaluated independently: validate against the binding
//! table, the agent registry, and the agent's free capacity, then dispatch
//! `RunContainer` and commit the binding only after the agent confirmed.
//! Proposals for the same pod are serialized through a per-pod lock;
//! distinct pods proceed in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gantry_api::{
    AgentStatus, Capacity, Container, ContainerState, Propose, RejectReason, RunContainerRequest,
    ScaleUpProposeRequest, ScaleUpProposeResponse,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::EngineClient;
use crate::registry::AgentRegistry;

/// Source of the workload definition behind a pod name. The mapping itself
/// is produced outside the scheduler and injected here.
pub trait PodSpecs: Send + Sync {
    fn container_for(&self, pod_name: &str) -> Container;
}

/// Pod specs from a static table with a fallback default.
pub struct StaticPodSpecs {
    default: Container,
    overrides: HashMap<String, Container>,
}

impl StaticPodSpecs {
    pub fn new(default: Container) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, pod_name: impl Into<String>, container: Container) -> Self {
        self.overrides.insert(pod_name.into(), container);
        self
    }

    /// Load from a JSON file: `{"default": Container, "pods": {name: Container}}`.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        #[derive(serde::Deserialize)]
        struct SpecFile {
            default: Container,
            #[serde(default)]
            pods: HashMap<String, Container>,
        }
        let raw = std::fs::read_to_string(path)?;
        let parsed: SpecFile = serde_json::from_str(&raw)?;
        Ok(Self {
            default: parsed.default,
            overrides: parsed.pods,
        })
    }
}

impl PodSpecs for StaticPodSpecs {
    fn container_for(&self, pod_name: &str) -> Container {
        self.overrides
            .get(pod_name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// A committed pod placement.
#[derive(Debug, Clone)]
pub struct Binding {
    pub endpoint: String,
    pub bound_at: DateTime<Utc>,
}

/// Timeouts and defaults for proposal evaluation.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Timeout for the `RunContainer` dispatch.
    pub call_timeout: Duration,
    /// Timeout for live agent-status probes.
    pub probe_timeout: Duration,
    /// Capacity assumed for pods whose container carries no requirement.
    pub default_reservation: Capacity,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            default_reservation: Capacity {
                cpu_millis: 500,
                memory_bytes: 256 * 1024 * 1024,
            },
        }
    }
}

pub struct Scheduler {
    bindings: RwLock<HashMap<String, Binding>>,
    /// Per-pod serialization of proposal evaluation.
    pod_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    registry: Arc<AgentRegistry>,
    engines: EngineClient,
    specs: Arc<dyn PodSpecs>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        engines: EngineClient,
        specs: Arc<dyn PodSpecs>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            pod_locks: Mutex::new(HashMap::new()),
            registry,
            engines,
            specs,
            config,
        }
    }

    /// Evaluate a propose batch. Every `pod_name` in the request lands in
    /// exactly one of accepted/rejected.
    pub async fn scale_up_propose(&self, request: ScaleUpProposeRequest) -> ScaleUpProposeResponse {
        let mut response = ScaleUpProposeResponse::default();

        // pod_name must be unique within one request; duplicated names are
        // rejected wholesale rather than evaluated twice.
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for propose in &request.proposes {
            *counts.entry(propose.pod_name.as_str()).or_default() += 1;
        }
        let duplicates: HashSet<String> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, _)| name.to_string())
            .collect();

        let mut handled: HashSet<String> = HashSet::new();
        for propose in &request.proposes {
            if duplicates.contains(&propose.pod_name) {
                response
                    .rejected
                    .insert(propose.pod_name.clone(), RejectReason::InvalidRequest);
                continue;
            }
            if !handled.insert(propose.pod_name.clone()) {
                continue;
            }
            match self.evaluate(propose).await {
                Ok(()) => response.accepted.push(propose.pod_name.clone()),
                Err(reason) => {
                    response.rejected.insert(propose.pod_name.clone(), reason);
                }
            }
        }

        info!(
            accepted = response.accepted.len(),
            rejected = response.rejected.len(),
            "propose batch evaluated"
        );
        response
    }

    async fn evaluate(&self, propose: &Propose) -> Result<(), RejectReason> {
        if propose.pod_name.is_empty() || propose.endpoint.is_empty() {
            return Err(RejectReason::InvalidRequest);
        }

        let lock = self.pod_lock(&propose.pod_name).await;
        let _serial = lock.lock().await;

        if let Some(binding) = self.bindings.read().await.get(&propose.pod_name) {
            if binding.endpoint == propose.endpoint {
                debug!(
                    pod = %propose.pod_name,
                    endpoint = %propose.endpoint,
                    "pod already bound here, propose is a no-op"
                );
                return Ok(());
            }
            warn!(
                pod = %propose.pod_name,
                bound_to = %binding.endpoint,
                proposed = %propose.endpoint,
                "pod already bound elsewhere"
            );
            return Err(RejectReason::AlreadyBound);
        }

        let status = self.agent_status(&propose.endpoint).await?;

        let container = self.specs.container_for(&propose.pod_name);
        let want = container
            .resources
            .unwrap_or(self.config.default_reservation);
        if !want.fits_within(&status.free()) {
            warn!(
                pod = %propose.pod_name,
                endpoint = %propose.endpoint,
                free_cpu_millis = status.free().cpu_millis,
                want_cpu_millis = want.cpu_millis,
                "agent lacks capacity for pod"
            );
            return Err(RejectReason::InsufficientResources);
        }

        // Execute on accept; the binding commits only after the agent
        // confirmed the launch.
        let run = RunContainerRequest {
            name: propose.pod_name.clone(),
            container,
        };
        match self
            .engines
            .run_container(&propose.endpoint, &run, self.config.call_timeout)
            .await
        {
            Ok(answer) if answer.status != ContainerState::Failed => {
                self.bindings.write().await.insert(
                    propose.pod_name.clone(),
                    Binding {
                        endpoint: propose.endpoint.clone(),
                        bound_at: Utc::now(),
                    },
                );
                info!(
                    pod = %propose.pod_name,
                    endpoint = %propose.endpoint,
                    status = answer.status.as_str(),
                    "pod bound"
                );
                Ok(())
            }
            Ok(answer) => {
                warn!(
                    pod = %propose.pod_name,
                    endpoint = %propose.endpoint,
                    error = ?answer.error,
                    "agent failed to launch pod container"
                );
                Err(RejectReason::LaunchFailed)
            }
            Err(e) => {
                warn!(pod = %propose.pod_name, error = %e, "agent call failed");
                Err(RejectReason::AgentUnreachable)
            }
        }
    }

    /// Agent state for validation: a fresh registry entry, or a live probe
    /// when the cache is stale or absent.
    async fn agent_status(&self, endpoint: &str) -> Result<AgentStatus, RejectReason> {
        if let Some(status) = self.registry.fresh_status(endpoint).await {
            return Ok(status);
        }
        match self
            .engines
            .agent_status(endpoint, self.config.probe_timeout)
            .await
        {
            Ok(status) => {
                self.registry.record_heartbeat(endpoint, status.clone()).await;
                Ok(status)
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "agent status probe failed");
                Err(RejectReason::AgentUnreachable)
            }
        }
    }

    /// Current bindings, sorted by pod name.
    pub async fn bindings(&self) -> Vec<(String, Binding)> {
        let bindings = self.bindings.read().await;
        let mut entries: Vec<(String, Binding)> = bindings
            .iter()
            .map(|(pod, binding)| (pod.clone(), binding.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    async fn pod_lock(&self, pod_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.pod_locks.lock().await;
        locks
            .entry(pod_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_api::{RunContainerResponse, RunFailure};
    use rstest::rstest;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn agent_status_body(free_cpu_millis: i64) -> AgentStatus {
        AgentStatus {
            capacity: Capacity {
                cpu_millis: 4000,
                memory_bytes: 8 << 30,
            },
            used: Capacity {
                cpu_millis: 4000 - free_cpu_millis,
                memory_bytes: 0,
            },
            containers: 0,
        }
    }

    async fn mount_engine(server: &MockServer, free_cpu_millis: i64) {
        Mock::given(method("GET"))
            .and(path("/v1/status"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(agent_status_body(free_cpu_millis)),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/containers"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(RunContainerResponse::ok(ContainerState::Running)),
            )
            .mount(server)
            .await;
    }

    fn scheduler(registry: Arc<AgentRegistry>) -> Scheduler {
        Scheduler::new(
            registry,
            EngineClient::new().unwrap(),
            Arc::new(StaticPodSpecs::new(Container::process())),
            SchedulerConfig {
                call_timeout: Duration::from_secs(2),
                probe_timeout: Duration::from_millis(500),
                default_reservation: Capacity {
                    cpu_millis: 500,
                    memory_bytes: 256 << 20,
                },
            },
        )
    }

    fn propose_request(entries: &[(&str, &str)]) -> ScaleUpProposeRequest {
        ScaleUpProposeRequest {
            proposes: entries
                .iter()
                .map(|(endpoint, pod_name)| Propose {
                    endpoint: endpoint.to_string(),
                    pod_name: pod_name.to_string(),
                })
                .collect(),
        }
    }

    /// An endpoint with nothing listening on it.
    async fn dead_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test]
    async fn test_accepts_and_binds_on_confirmed_launch() {
        let engine = MockServer::start().await;
        mount_engine(&engine, 4000).await;
        let endpoint = engine.address().to_string();

        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let scheduler = scheduler(registry);

        let response = scheduler
            .scale_up_propose(propose_request(&[(&endpoint, "1_pod.dfs")]))
            .await;
        assert_eq!(response.accepted, vec!["1_pod.dfs"]);
        assert!(response.rejected.is_empty());

        let bindings = scheduler.bindings().await;
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].1.endpoint, endpoint);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_rejected() {
        let endpoint = dead_endpoint().await;
        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let scheduler = scheduler(registry);

        let response = scheduler
            .scale_up_propose(propose_request(&[(&endpoint, "3_pod.dfs")]))
            .await;
        assert!(response.accepted.is_empty());
        assert_eq!(
            response.rejected.get("3_pod.dfs"),
            Some(&RejectReason::AgentUnreachable)
        );
        assert!(scheduler.bindings().await.is_empty());
    }

    #[tokio::test]
    async fn test_repropose_same_endpoint_is_idempotent() {
        let engine = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(agent_status_body(4000)))
            .mount(&engine)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/containers"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(RunContainerResponse::ok(ContainerState::Running)),
            )
            .expect(1)
            .mount(&engine)
            .await;
        let endpoint = engine.address().to_string();

        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let scheduler = scheduler(registry);

        let first = scheduler
            .scale_up_propose(propose_request(&[(&endpoint, "1_pod.dfs")]))
            .await;
        assert_eq!(first.accepted, vec!["1_pod.dfs"]);

        // Accepted again, with no second dispatch (checked by the mock's
        // expectation on drop).
        let second = scheduler
            .scale_up_propose(propose_request(&[(&endpoint, "1_pod.dfs")]))
            .await;
        assert_eq!(second.accepted, vec!["1_pod.dfs"]);
        assert_eq!(scheduler.bindings().await.len(), 1);
    }

    #[tokio::test]
    async fn test_repropose_other_endpoint_conflicts() {
        let engine = MockServer::start().await;
        mount_engine(&engine, 4000).await;
        let endpoint = engine.address().to_string();

        let other = MockServer::start().await;
        mount_engine(&other, 4000).await;
        let other_endpoint = other.address().to_string();

        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let scheduler = scheduler(registry);

        scheduler
            .scale_up_propose(propose_request(&[(&endpoint, "1_pod.dfs")]))
            .await;
        let response = scheduler
            .scale_up_propose(propose_request(&[(&other_endpoint, "1_pod.dfs")]))
            .await;
        assert_eq!(
            response.rejected.get("1_pod.dfs"),
            Some(&RejectReason::AlreadyBound)
        );

        let bindings = scheduler.bindings().await;
        assert_eq!(bindings[0].1.endpoint, endpoint);
    }

    #[tokio::test]
    async fn test_launch_failure_records_no_binding() {
        let engine = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(agent_status_body(4000)))
            .mount(&engine)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/containers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                RunContainerResponse::failed(RunFailure::NamespaceError, "boot failed"),
            ))
            .mount(&engine)
            .await;
        let endpoint = engine.address().to_string();

        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let scheduler = scheduler(registry);

        let response = scheduler
            .scale_up_propose(propose_request(&[(&endpoint, "1_pod.dfs")]))
            .await;
        assert_eq!(
            response.rejected.get("1_pod.dfs"),
            Some(&RejectReason::LaunchFailed)
        );
        assert!(scheduler.bindings().await.is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_capacity_is_rejected_before_dispatch() {
        let engine = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(agent_status_body(100)))
            .mount(&engine)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/containers"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&engine)
            .await;
        let endpoint = engine.address().to_string();

        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let scheduler = scheduler(registry);

        let response = scheduler
            .scale_up_propose(propose_request(&[(&endpoint, "1_pod.dfs")]))
            .await;
        assert_eq!(
            response.rejected.get("1_pod.dfs"),
            Some(&RejectReason::InsufficientResources)
        );
    }

    #[tokio::test]
    async fn test_cached_heartbeat_skips_the_probe() {
        let engine = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(agent_status_body(4000)))
            .expect(0)
            .mount(&engine)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/containers"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(RunContainerResponse::ok(ContainerState::Running)),
            )
            .mount(&engine)
            .await;
        let endpoint = engine.address().to_string();

        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        registry
            .record_heartbeat(&endpoint, agent_status_body(4000))
            .await;
        let scheduler = scheduler(registry);

        let response = scheduler
            .scale_up_propose(propose_request(&[(&endpoint, "1_pod.dfs")]))
            .await;
        assert_eq!(response.accepted, vec!["1_pod.dfs"]);
    }

    #[tokio::test]
    async fn test_every_pod_is_classified_exactly_once() {
        let engine = MockServer::start().await;
        mount_engine(&engine, 4000).await;
        let endpoint = engine.address().to_string();
        let dead = dead_endpoint().await;

        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let scheduler = scheduler(registry);

        let response = scheduler
            .scale_up_propose(propose_request(&[
                (&endpoint, "1_pod.dfs"),
                (&dead, "2_pod.dfs"),
                (&endpoint, "3_pod.dfs"),
            ]))
            .await;

        let mut classified: Vec<String> = response.accepted.clone();
        classified.extend(response.rejected.keys().cloned());
        classified.sort();
        assert_eq!(classified, vec!["1_pod.dfs", "2_pod.dfs", "3_pod.dfs"]);
    }

    #[rstest]
    #[case("", "1_pod.dfs")]
    #[case("127.0.0.1:7676", "")]
    #[tokio::test]
    async fn test_blank_fields_are_invalid(#[case] endpoint: &str, #[case] pod_name: &str) {
        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let scheduler = scheduler(registry);

        let response = scheduler
            .scale_up_propose(propose_request(&[(endpoint, pod_name)]))
            .await;
        assert!(response.accepted.is_empty());
        assert_eq!(
            response.rejected.get(pod_name),
            Some(&RejectReason::InvalidRequest)
        );
        assert!(scheduler.bindings().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_pod_names_are_rejected() {
        let engine = MockServer::start().await;
        mount_engine(&engine, 4000).await;
        let endpoint = engine.address().to_string();

        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let scheduler = scheduler(registry);

        let response = scheduler
            .scale_up_propose(propose_request(&[
                (&endpoint, "1_pod.dfs"),
                (&endpoint, "1_pod.dfs"),
                (&endpoint, "2_pod.dfs"),
            ]))
            .await;
        assert_eq!(response.accepted, vec!["2_pod.dfs"]);
        assert_eq!(
            response.rejected.get("1_pod.dfs"),
            Some(&RejectReason::InvalidRequest)
        );
        // The duplicated pod was never dispatched or bound.
        assert_eq!(scheduler.bindings().await.len(), 1);
    }

    #[tokio::test]
    async fn test_pod_spec_override_drives_the_dispatch() {
        let engine = MockServer::start().await;
        mount_engine(&engine, 4000).await;
        let endpoint = engine.address().to_string();

        let registry = Arc::new(AgentRegistry::new(Duration::from_secs(30)));
        let specs = StaticPodSpecs::new(Container::process())
            .with_override("1_pod.dfs", Container::image("http://host/dfs.tar.gz"));
        let scheduler = Scheduler::new(
            registry,
            EngineClient::new().unwrap(),
            Arc::new(specs),
            SchedulerConfig::default(),
        );

        let response = scheduler
            .scale_up_propose(propose_request(&[(&endpoint, "1_pod.dfs")]))
            .await;
        assert_eq!(response.accepted, vec!["1_pod.dfs"]);

        let requests = engine.received_requests().await.unwrap();
        let run = requests
            .iter()
            .find(|r| r.url.path() == "/v1/containers")
            .unwrap();
        let body: RunContainerRequest = serde_json::from_slice(&run.body).unwrap();
        assert_eq!(body.container, Container::image("http://host/dfs.tar.gz"));
    }
}

//! Accepting navigations and tracking the ones in flight.
//!
//! One navigation per browser target at a time. Each accepted navigation
//! runs on its own tokio task; the service keeps only its control handle so
//! abort, resume and status can reach it by id.

use super::orchestrator::{AgentConfig, Orchestrator};
use super::loop_detector::LoopDetectionConfig;
use super::session::{NavigationControl, NavigationResult, NavigationSession, StatusReport};
use crate::browser::{ActionExecutor, BrowserPage, ExecutorConfig, ObservationConfig};
use crate::emitter::{EmitterConfig, HttpStepEmitter, StepEmitter, TracingEmitter};
use crate::providers::{
    create_client, ClientOptions, ModelRegistry, ModelSpec, ProviderError, VisionClient,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Upper bound on `max_steps` a request may ask for.
pub const MAX_STEPS_LIMIT: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("goal must not be empty")]
    EmptyGoal,
    #[error("max_steps must be between 1 and {MAX_STEPS_LIMIT}, got {0}")]
    InvalidMaxSteps(u32),
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("target '{target_id}' is already running navigation {navigation_id}")]
    TargetBusy {
        target_id: String,
        navigation_id: String,
    },
    #[error("browser target '{target_id}' is unavailable: {message}")]
    Page { target_id: String, message: String },
}

/// What a caller asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NavigationRequest {
    pub goal: String,
    pub model: String,
    /// Provider key for this request; falls back to the configured key.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub start_url: Option<String>,
}

/// Builds a vision client for a resolved model.
pub trait ClientFactory: Send + Sync {
    fn create(&self, spec: &ModelSpec, api_key: Option<&str>) -> Result<Arc<dyn VisionClient>, ProviderError>;
}

/// Real HTTP clients wrapped in retries.
pub struct HttpClientFactory {
    options: ClientOptions,
}

impl HttpClientFactory {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(&self, spec: &ModelSpec, api_key: Option<&str>) -> Result<Arc<dyn VisionClient>, ProviderError> {
        let mut options = self.options.clone();
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            options.api_key = key.to_string();
        }
        create_client(spec, &options).map(Arc::from)
    }
}

/// Hands out the page a navigation drives.
#[async_trait]
pub trait PageProvider: Send + Sync {
    async fn page(&self, target_id: &str) -> anyhow::Result<Arc<dyn BrowserPage>>;
}

/// Always returns the same page, whatever the target id.
pub struct SharedPage(pub Arc<dyn BrowserPage>);

#[async_trait]
impl PageProvider for SharedPage {
    async fn page(&self, _target_id: &str) -> anyhow::Result<Arc<dyn BrowserPage>> {
        Ok(Arc::clone(&self.0))
    }
}

/// Per-navigation settings the service applies to every orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    pub agent: AgentConfig,
    pub executor: ExecutorConfig,
    pub observation: ObservationConfig,
    pub loop_detection: LoopDetectionConfig,
    pub emitter: EmitterConfig,
}

/// Handle returned once a navigation is accepted.
pub struct NavigationAccepted {
    pub navigation_id: String,
    pub task: JoinHandle<NavigationResult>,
}

struct ActiveNavigation {
    navigation_id: String,
    control: Arc<NavigationControl>,
}

type ActiveMap = Arc<Mutex<HashMap<String, ActiveNavigation>>>;

pub struct NavigationService {
    registry: Arc<ModelRegistry>,
    clients: Arc<dyn ClientFactory>,
    pages: Arc<dyn PageProvider>,
    settings: ServiceSettings,
    active: ActiveMap,
}

/// Removes the target's entry when the navigation task ends, however it ends.
struct ActiveGuard {
    active: ActiveMap,
    target_id: String,
    navigation_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if active
            .get(&self.target_id)
            .is_some_and(|entry| entry.navigation_id == self.navigation_id)
        {
            active.remove(&self.target_id);
        }
    }
}

impl NavigationService {
    pub fn new(
        registry: Arc<ModelRegistry>,
        clients: Arc<dyn ClientFactory>,
        pages: Arc<dyn PageProvider>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            registry,
            clients,
            pages,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Validate `request`, reserve its target and spawn the navigation.
    pub async fn accept(&self, request: NavigationRequest) -> Result<NavigationAccepted, ServiceError> {
        let goal = request.goal.trim();
        if goal.is_empty() {
            return Err(ServiceError::EmptyGoal);
        }
        let max_steps = request.max_steps.unwrap_or(self.settings.agent.max_steps);
        if max_steps == 0 || max_steps > MAX_STEPS_LIMIT {
            return Err(ServiceError::InvalidMaxSteps(max_steps));
        }
        let spec = self
            .registry
            .get(&request.model)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownModel(request.model.clone()))?;
        let client = self.clients.create(&spec, request.api_key.as_deref())?;

        let target_id = request.target_id.clone().unwrap_or_else(|| "default".to_string());
        let mut session = NavigationSession::new(&target_id, goal, &spec.id, max_steps);
        session.start_url = request.start_url.clone();
        session.callback_url = request.callback_url.clone();

        let control = Arc::new(NavigationControl::new());
        self.reserve(&session, Arc::clone(&control))?;
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            target_id: target_id.clone(),
            navigation_id: session.navigation_id.clone(),
        };

        let page = match self.pages.page(&target_id).await {
            Ok(page) => page,
            Err(err) => {
                drop(guard);
                return Err(ServiceError::Page {
                    target_id,
                    message: format!("{err:#}"),
                });
            }
        };

        let emitter: Arc<dyn StepEmitter> = match &session.callback_url {
            Some(url) => Arc::new(HttpStepEmitter::new(url.clone(), self.settings.emitter.clone())),
            None => Arc::new(TracingEmitter),
        };
        let orchestrator = Orchestrator::new(client, page, emitter)
            .with_config(self.settings.agent.clone())
            .with_executor(ActionExecutor::new(self.settings.executor.clone()))
            .with_observation(self.settings.observation.clone())
            .with_loop_detection(self.settings.loop_detection.clone())
            .with_control(control);

        let navigation_id = session.navigation_id.clone();
        tracing::info!(%navigation_id, target_id = %target_id, "Navigation accepted");
        let task = tokio::spawn(async move {
            let _guard = guard;
            orchestrator.run(&session).await
        });
        Ok(NavigationAccepted { navigation_id, task })
    }

    fn reserve(&self, session: &NavigationSession, control: Arc<NavigationControl>) -> Result<(), ServiceError> {
        let mut active = self.active.lock();
        if let Some(existing) = active.get(&session.target_id) {
            return Err(ServiceError::TargetBusy {
                target_id: session.target_id.clone(),
                navigation_id: existing.navigation_id.clone(),
            });
        }
        active.insert(
            session.target_id.clone(),
            ActiveNavigation {
                navigation_id: session.navigation_id.clone(),
                control,
            },
        );
        Ok(())
    }

    fn control(&self, navigation_id: &str) -> Option<Arc<NavigationControl>> {
        self.active
            .lock()
            .values()
            .find(|entry| entry.navigation_id == navigation_id)
            .map(|entry| Arc::clone(&entry.control))
    }

    /// Request cancellation. `false` when no such navigation is running.
    pub fn abort(&self, navigation_id: &str) -> bool {
        match self.control(navigation_id) {
            Some(control) => {
                control.abort();
                true
            }
            None => false,
        }
    }

    /// Resume a navigation paused for a human. `false` when it is unknown
    /// or not paused.
    pub fn resume(&self, navigation_id: &str) -> bool {
        self.control(navigation_id).is_some_and(|control| control.resume())
    }

    pub fn status(&self, navigation_id: &str) -> Option<StatusReport> {
        self.control(navigation_id)
            .map(|control| control.report(navigation_id))
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

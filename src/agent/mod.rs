pub mod history;
pub mod loop_detector;
pub mod orchestrator;
pub mod prompt;
pub mod service;
pub mod session;

pub use history::ConversationHistory;
pub use loop_detector::{ActionFamily, LoopDetectionConfig, LoopDetector, LoopVerdict};
pub use orchestrator::{AgentConfig, Orchestrator};
pub use service::{
    ClientFactory, HttpClientFactory, NavigationAccepted, NavigationRequest, NavigationService,
    PageProvider, ServiceError, ServiceSettings, SharedPage,
};
pub use session::{
    NavigationControl, NavigationPhase, NavigationResult, NavigationSession, NavigationStatus,
    NavigationStep, StatusReport,
};

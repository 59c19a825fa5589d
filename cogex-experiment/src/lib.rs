pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod order;
pub mod protocol;
pub mod recorder;
pub mod response;
pub mod session;
pub mod timeline;

pub use config::ExperimentConfig;
pub use engine::{Engine, EngineEvent};
pub use error::{ConfigError, EngineError, TransmitError};
pub use loader::{AssetLoader, AssetRoot, LoadProgress, RetryPolicy};
pub use order::{ConditionShare, TrialOrder, TrialOrderGenerator};
pub use protocol::{ProtocolKind, with_practice};
pub use recorder::{JsonFileTransmitter, SessionRecorder, TransmissionClient};
pub use response::{ResponseOutcome, ResponseWindow};
pub use session::{DisplayInfo, EnvironmentDescriptor, SessionMeta, SessionPayload, TrialCounts};
pub use timeline::{TimelineEvent, TrialTimeline};

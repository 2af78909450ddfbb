pub mod decision;
pub mod profile;
pub mod progress;
pub mod request;
pub mod session;

pub use decision::PlaybackDecision;
pub use profile::{ClientKind, DeviceProfile};
pub use progress::{TranscodeProgress, TranscodeStage};
pub use request::{ContainerFormat, Resolution, SpeedPriority, TranscodeRequest};
pub use session::{
    ProviderStats, SessionFilter, SessionRecord, SessionResult, SessionStatus,
};

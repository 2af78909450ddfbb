pub mod cleanup;
pub mod manager;

pub use cleanup::{CleanupService, CleanupStats};
pub use manager::{StartedTranscode, TranscodeManager};

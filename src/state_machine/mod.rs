mod job;
mod step;
mod transition;

pub use job::{
    AssemblyProvider, DispatchMessage, ImageProvider, JobArtifacts, JobConfig, JobState,
    JobStatus, JobSummary, KeyList, MusicProvider, NarrationProvider, SingleKey, StepStatus,
    StoryArtifact, StoryProvider, VideoArtifact,
};
pub use step::Step;
pub use transition::{CompleteOutcome, InitOutcome, StateMachine};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// The five production steps of a storyreel job, in execution order.
///
/// Each job flows through: STORY → IMAGES → NARRATION → MUSIC → ASSEMBLY
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    GenerateStory,
    GenerateImages,
    GenerateNarration,
    GenerateMusic,
    AssembleOutput,
}

impl Step {
    /// The full catalog in its total order.
    pub const ALL: [Step; 5] = [
        Step::GenerateStory,
        Step::GenerateImages,
        Step::GenerateNarration,
        Step::GenerateMusic,
        Step::AssembleOutput,
    ];

    /// The step every job starts with.
    pub fn first() -> Step {
        Self::ALL[0]
    }

    /// The step immediately after `self`, or `None` for the last step.
    pub fn next(self) -> Option<Step> {
        Self::ALL.get(self.position() + 1).copied()
    }

    /// Zero-based index of this step in the catalog.
    pub fn position(self) -> usize {
        match self {
            Step::GenerateStory => 0,
            Step::GenerateImages => 1,
            Step::GenerateNarration => 2,
            Step::GenerateMusic => 3,
            Step::AssembleOutput => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::GenerateStory => "generate-story",
            Step::GenerateImages => "generate-images",
            Step::GenerateNarration => "generate-narration",
            Step::GenerateMusic => "generate-music",
            Step::AssembleOutput => "assemble-output",
        }
    }

    /// Artifact-store category this step writes under (`{jobId}/{category}/...`).
    pub fn category(self) -> &'static str {
        match self {
            Step::GenerateStory => "story",
            Step::GenerateImages => "images",
            Step::GenerateNarration => "audio",
            Step::GenerateMusic => "music",
            Step::AssembleOutput => "video",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = PipelineError;

    /// Accepts the kebab-case identifiers plus the older snake_case names
    /// still found in queued messages (`generate_tts`, `assemble_video`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "generate-story" | "generate_story" => Ok(Step::GenerateStory),
            "generate-images" | "generate_images" => Ok(Step::GenerateImages),
            "generate-narration" | "generate_narration" | "generate_tts" => {
                Ok(Step::GenerateNarration)
            }
            "generate-music" | "generate_music" => Ok(Step::GenerateMusic),
            "assemble-output" | "assemble_output" | "assemble_video" => Ok(Step::AssembleOutput),
            other => Err(PipelineError::UnknownStep(other.to_string())),
        }
    }
}

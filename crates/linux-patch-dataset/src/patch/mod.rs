pub mod diff;
pub mod fetch;

pub use diff::{FileChange, FileDiff, PatchAnalysis, PatchSet};
pub use fetch::{HttpPatchSource, PatchSource};

pub mod merger;

pub use merger::{FfmpegMerger, MergeCollaborator, MergeError, MergeJob};

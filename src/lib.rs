//! Incremental update packages for game-asset trees.
//!
//! A patch package carries only the byte-level deltas for changed
//! entries inside bundle containers, plus whole copies for additions,
//! instead of redistributing the entire asset tree. Generation indexes
//! two versions of a tree down to the entries inside each bundle,
//! diffs them structurally, and writes a `manifest.json` plus a
//! `patches/` directory of artifacts. Application replays the manifest
//! against a base tree, verifying content hashes before and after every
//! delta, and rebuilds modified bundles losslessly.

pub mod apply;
pub mod bundle;
pub mod cache;
pub mod delta;
pub mod diff;
pub mod error;
pub mod generate;
pub mod index;
pub mod manifest;
pub mod util;

pub use apply::{apply_patch, ApplyOptions, ApplySummary};
pub use error::{PatchError, Result};
pub use generate::{generate_patch, GenerateOptions, GenerateSummary};
pub use index::{ContentIndex, LoadOptions};
pub use manifest::{Operation, PatchManifest};
pub use util::CancelToken;

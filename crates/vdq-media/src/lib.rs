//! Media extraction for the VDQ fetch pipeline.
//!
//! Wraps `yt-dlp` behind the `Extractor` trait: one staging directory per
//! fetch, progress ticks parsed from the process output.

pub mod error;
pub mod extract;
pub mod ytdlp;

pub use error::{MediaError, MediaResult};
pub use extract::{remove_staging, Extracted, Extractor};
pub use ytdlp::{YtDlpConfig, YtDlpExtractor};

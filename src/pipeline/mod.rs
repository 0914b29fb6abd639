//! Image stages of a submission.
//!
//! Each submodule implements exactly one transformation step, so each can
//! be tested on its own and the remote backend can be swapped without
//! touching the local stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ preprocess ──▶ encode ──▶ remote ──▶ finish
//! (path/URL)  (brighten,    (PNG)     (hosted    (contrast,
//!              downsample)             models)    sharpness)
//! ```
//!
//! 1. [`input`]      — read or download the photo and reject non-images
//! 2. [`preprocess`] — shadow reveal and pixel ceiling; CPU-bound
//! 3. [`encode`]     — PNG encoding and data-URI helpers
//! 4. [`remote`]     — hosted model calls and output normalisation; the
//!    only stage with network I/O
//! 5. [`finish`]     — deterministic contrast and sharpness filters

pub mod encode;
pub mod finish;
pub mod input;
pub mod preprocess;
pub mod remote;

//! Stages and collaborators of a channel run.
//!
//! Each submodule does one job and is testable on its own; the orchestration
//! lives in [`crate::channel`].
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ capture ──▶ tile ──▶ analyze ──▶ <tile_dir>_analysis.md
//! (jobs)    (HTTP API)  (image)  (VLM)
//!                                  ▲
//!                    encode, extract, postprocess
//! ```
//!
//! 1. [`input`]   — resolve URLs, screenshots, directories and URL lists into jobs
//! 2. [`capture`] — screenshot a channel page through the screenshot API
//! 3. [`tile`]    — cut the screenshot into overlapping bands; CPU-bound, runs
//!    in `spawn_blocking`
//! 4. [`analyze`] — send the ordered tiles to a vision model, persist the report
//!
//! [`encode`], [`extract`] and [`postprocess`] are helpers of the analysis
//! stage: tile → base64, context document → text, raw reply → clean Markdown.

pub mod analyze;
pub mod capture;
pub mod encode;
pub mod extract;
pub mod input;
pub mod postprocess;
pub mod tile;

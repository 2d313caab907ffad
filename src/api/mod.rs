//! HTTP API for browsing prompts and running analyses.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/prompts` - List catalog prompts
//! - `POST /api/prompts` - Save a custom prompt
//! - `GET /api/prompts/:id` - Parsed prompt and its raw text
//! - `POST /api/prompts/:id/preview` - Render a prompt with partial variables
//! - `POST /api/runs` - Start a run
//! - `GET /api/runs` - Run history, newest first
//! - `DELETE /api/runs` - Clear run history
//! - `GET /api/runs/:id` - One run record
//! - `POST /api/runs/:id/cancel` - Cancel an in-progress run
//! - `POST /api/runs/:id/save-prompt` - Save a generated template as a custom prompt

mod routes;
pub mod types;

pub use routes::{router, serve, ApiError, AppState};

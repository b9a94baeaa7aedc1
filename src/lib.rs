//! bizlens: query proxy backend for business-metrics dashboards.
//!
//! A request names a registered query and its parameters. The [`Pipeline`]
//! serves rows from a TTL cache or the row-store and, when asked, attaches an
//! AI narrative produced by a streaming analysis workflow. Analysis is best
//! effort: its failure never fails the data request.
//!
//! ```no_run
//! use bizlens::{Config, Pipeline};
//!
//! # async fn run() -> bizlens::Result<()> {
//! let config = Config::load(None)?;
//! let pipeline = Pipeline::from_config(&config).await?;
//! let resp = pipeline
//!     .handle("revenue_by_month", vec![serde_json::json!("emea")], true)
//!     .await;
//! println!("{}", serde_json::to_string_pretty(&resp)?);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
#[cfg(feature = "server")]
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod store;

pub use config::Config;
pub use error::{ErrorKind, LensError, Result};
pub use pipeline::{Pipeline, PipelineResponse, ResponseStatus};
pub use registry::{QueryDefinition, QueryRegistry};

//! Validate yamp dashboard configuration and fetch metric values from Prometheus.
//!
//! Load the configuration once with [`load_config`], then query Prometheus through a
//! [`PrometheusClient`] session:
//!
//! ```no_run
//! # async fn run() -> color_eyre::Result<()> {
//! let cfg = yamp::load_config()?;
//! let mut client = yamp::PrometheusClient::try_from(&cfg)?;
//! let session = client.session()?;
//! for metric in cfg.dashboards.iter().flat_map(|d| &d.metrics) {
//!     for sample in session.fetch_metric(&metric.query).await? {
//!         println!("{}: {:?} = {}", metric.title, sample.labels, sample.value);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod alert;
pub mod config_file;
pub mod query;

pub use alert::{AlertConfig, AlertPriority};
pub use config_file::{
    default_config_path, load_config, parse_config_str, Config, ConfigError, ConfigLoader,
    Dashboard, FieldError, Format, Metric, ParseError, ValidationErrors,
};
pub use query::{ClientError, PrometheusClient, Sample, Session};

//! # mesh-predict
//!
//! Clients for the external forecasting and training services and the
//! observed-latency sample pipeline that feeds retraining.
//!
//! - [`client::HttpForecaster`] calls one of several replicated forecaster
//!   endpoints per candidate, chosen by an [`endpoint::EndpointSelector`]
//! - [`fanout::ForecastFanout`] forecasts every candidate of a decision
//!   concurrently under a single deadline
//! - [`samples::SampleCollector`] records TTFT and strided TPOT while a
//!   response streams and finalizes samples into an [`samples::UploadBuffer`]
//! - [`uploader::SampleUploader`] drains that buffer to the trainer in the
//!   background with retry and backoff
//! - [`watcher::TrainerWatcher`] tracks trainer readiness and model versions
//! - [`mock`] holds in-process doubles for both services

pub mod client;
pub mod endpoint;
pub mod fanout;
pub mod mock;
pub mod samples;
pub mod trainer;
pub mod uploader;
pub mod watcher;

pub use client::HttpForecaster;
pub use endpoint::{EndpointSelector, HashedSelector, RoundRobinSelector, SelectorFactory, SelectorStats};
pub use fanout::{FanoutResult, ForecastFanout};
pub use mock::{MockForecaster, MockTrainer};
pub use samples::{is_sampled, BufferStats, PendingBatch, SampleCollector, UploadBuffer};
pub use trainer::HttpTrainerClient;
pub use uploader::{SampleUploader, UploaderStats};
pub use watcher::TrainerWatcher;

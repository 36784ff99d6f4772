pub mod alert;
pub mod cancel;
pub mod caption;
pub mod capture;
pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod media;
pub mod notifier;
pub mod pipeline;
pub mod state;
pub mod upload;

#[cfg(test)]
pub mod test_support;

pub use alert::{Alerter, LarkAlerter, LogAlerter};
pub use cancel::CancellationToken;
pub use config::{Config, Credentials};
pub use download::{Fetcher, HttpFetcher};
pub use media::{MediaEntry, MediaType, UploadErrorKind};
pub use notifier::{ChatNotifier, TelegramNotifier};
pub use pipeline::{Pipeline, RunOptions, RunResult};

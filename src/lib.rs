pub mod config;
pub mod config_validation;
pub mod error;
pub mod forwarding;
pub mod identity;
pub mod logging;
pub mod monitoring;
pub mod proxy;
pub mod resolver;
pub mod rewrite;
pub mod secrets;

pub use config::Config;
pub use error::ProxyError;
pub use forwarding::{EngineSettings, ForwardingEngine, ProxyBody};
pub use proxy::{PreviewRouter, PreviewServer};
pub use resolver::{DaytonaPreviewResolver, PreviewLink, PreviewResolver};

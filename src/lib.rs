pub mod billing;
pub mod config;
pub mod error;
pub mod logging;
pub mod providers;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod tokenizer;
pub mod translate;

pub use billing::{LogSettler, SettleGuard, UsageSettler};
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use logging::SharedLogger;
pub use relay::{Channel, RelayInfo};
pub use server::{build_router, AppState};

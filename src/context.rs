use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::hardware::HardwareAdapter;
use crate::core::transfer_engine::{self, TransferEngine};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub adapter: Arc<dyn HardwareAdapter>,
    pub engine: Arc<dyn TransferEngine>,
    /// Fired on SIGINT/SIGTERM.
    pub cancel: CancellationToken,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        adapter: Arc<dyn HardwareAdapter>,
        engine: Arc<dyn TransferEngine>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            adapter,
            engine,
            cancel: CancellationToken::new(),
        }
    }

    /// Host hardware and the rsync engine built from the configured tools.
    pub fn for_host(config: AppConfig) -> Self {
        let engine = transfer_engine::create_engine(&config.tools);
        Self::new(config, crate::adapters::get_adapter(), engine)
    }
}

//! Chat facade tunables — SPEC_FULL.md §2.1.

use workflow_core::PollingConfig;

/// Tunables for [`crate::execution_service::ExecutionService`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionServiceConfig {
    /// Cadence used by `waitForTerminalState` (§4.7).
    pub polling: PollingConfig,
}

impl ExecutionServiceConfig {
    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }
}

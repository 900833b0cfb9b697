use super::config::AppConfig;
use crate::rebalance::SessionHandle;
use crate::store::FlagStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub flag: Arc<FlagStore>,
    pub session: SessionHandle,
}

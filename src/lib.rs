pub mod network;
pub mod protocol;
pub mod service;

pub use service::GLOBAL_CONFIG;
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, DevcomConfig,
    Server, Shutdown,
};

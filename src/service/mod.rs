pub use app_error::{AppError, AppResult};
pub use config::{
    global_config, ConnectionConfig, DevcomConfig, NetworkConfig, SenderPoolConfig, GLOBAL_CONFIG,
};
pub use echo::{EchoHandler, STATUS_CHECK_FAILED, STATUS_OK};
pub use server::{ConnectionHandler, Server};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod echo;
mod server;
mod shutdown;
mod tracing_config;

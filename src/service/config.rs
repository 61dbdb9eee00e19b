use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::network::{MAX_QUEUE_SIZE, MIN_RECEIVE_BUFFER};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<DevcomConfig> = OnceCell::new();

/// Returns the process-wide configuration, falling back to the built-in defaults when
/// no file was loaded.
pub fn global_config() -> &'static DevcomConfig {
    GLOBAL_CONFIG.get_or_init(DevcomConfig::default)
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// Upper bound of a single frame's content, in bytes.
    pub max_package_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9400,
            max_connection: 1024,
            max_package_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-connection buffering.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Smallest write buffer requested from the application pipe for one receive.
    pub min_receive_buffer: usize,
    /// Unconsumed bytes at which a pipe flush starts waiting for the reader.
    pub pause_writer_threshold: usize,
    /// Unconsumed bytes at which a paused flush is released again.
    pub resume_writer_threshold: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            min_receive_buffer: MIN_RECEIVE_BUFFER,
            pause_writer_threshold: 64 * 1024,
            resume_writer_threshold: 32 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SenderPoolConfig {
    pub max_queue_size: usize,
}

impl Default for SenderPoolConfig {
    fn default() -> Self {
        SenderPoolConfig {
            max_queue_size: MAX_QUEUE_SIZE,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DevcomConfig {
    pub network: NetworkConfig,
    pub connection: ConnectionConfig,
    pub sender_pool: SenderPoolConfig,
}

impl DevcomConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<DevcomConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let devcom_config: DevcomConfig = config.try_deserialize()?;
        devcom_config.validate()?;

        Ok(devcom_config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.sender_pool.max_queue_size == 0 {
            return Err(AppError::InvalidValue(
                "sender_pool.max_queue_size must be greater than 0".to_string(),
            ));
        }
        if self.connection.min_receive_buffer == 0 {
            return Err(AppError::InvalidValue(
                "connection.min_receive_buffer must be greater than 0".to_string(),
            ));
        }
        if self.connection.resume_writer_threshold > self.connection.pause_writer_threshold {
            return Err(AppError::InvalidValue(format!(
                "connection.resume_writer_threshold {} exceeds pause_writer_threshold {}",
                self.connection.resume_writer_threshold, self.connection.pause_writer_threshold
            )));
        }
        Ok(())
    }
}

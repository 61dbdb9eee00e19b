// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    /// transport errors, `code` is the native socket error code (-1 when the OS reported none)
    #[error("socket error {code}: {message}")]
    SocketError { code: i32, message: String },

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Wraps a failed native socket operation, keeping its OS error code.
    pub fn socket(error: io::Error) -> AppError {
        AppError::SocketError {
            code: error.raw_os_error().unwrap_or(-1),
            message: error.to_string(),
        }
    }

    /// The native error code of a transport error.
    pub fn socket_error_code(&self) -> Option<i32> {
        match self {
            AppError::SocketError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_error_keeps_native_code() {
        let error = AppError::socket(io::Error::from_raw_os_error(104));
        assert_eq!(error.socket_error_code(), Some(104));

        let error = AppError::socket(io::Error::new(io::ErrorKind::Other, "no os code"));
        assert_eq!(error.socket_error_code(), Some(-1));
        assert_eq!(AppError::Incomplete.socket_error_code(), None);
    }
}

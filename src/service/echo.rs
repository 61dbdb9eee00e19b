use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::network::{FrameReader, FrameWriter, SocketConnection};
use crate::protocol::{Record, SocketRecord, StatusRecord};
use crate::service::{ConnectionHandler, Shutdown};
use crate::AppResult;

pub const STATUS_OK: u8 = 0;
pub const STATUS_CHECK_FAILED: u8 = 1;

/// Answers every frame with the same command and content.
///
/// The reply keeps the request's status category; its status is [`STATUS_OK`], or
/// [`STATUS_CHECK_FAILED`] when the content does not match the head's check.
/// Frames that cannot be decoded are dropped.
#[derive(Debug, Clone)]
pub struct EchoHandler {
    max_package_size: usize,
}

impl EchoHandler {
    pub fn new(max_package_size: usize) -> Self {
        EchoHandler { max_package_size }
    }

    pub fn reply(&self, request: &SocketRecord) -> AppResult<SocketRecord> {
        let status = if request.verify_check() {
            STATUS_OK
        } else {
            STATUS_CHECK_FAILED
        };
        SocketRecord::new(
            request.head.command.clone(),
            StatusRecord::new(request.head.status.category, status),
            request.content.clone(),
        )
    }
}

impl ConnectionHandler for EchoHandler {
    async fn handle(
        &self,
        connection: &mut SocketConnection<TcpStream>,
        shutdown: &mut Shutdown,
    ) -> AppResult<()> {
        let connection_id = connection.connection_id();
        let mut reader = FrameReader::<Bytes>::new(self.max_package_size);
        let mut writer = FrameWriter::new();
        let (input, output) = connection.pipes();

        loop {
            let maybe_record = tokio::select! {
                res = reader.read_frame(input) => res?,
                _ = shutdown.recv() => {
                    debug!("connection {} handler exit after shutdown signal", connection_id);
                    return Ok(());
                }
            };
            let Some(request) = maybe_record else {
                debug!("connection {} input completed", connection_id);
                break;
            };
            if !request.is_valid() {
                warn!("connection {} dropped an undecodable frame", connection_id);
                continue;
            }

            let reply = self.reply(&request)?;
            let flush = writer.write_frame(output, &reply).await?;
            if flush.is_completed || flush.is_canceled {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CheckRecord, CommandRecord};

    #[test]
    fn reply_reports_check_outcome() {
        let handler = EchoHandler::new(1024);
        let request = SocketRecord::new(
            CommandRecord::new(4, 5),
            StatusRecord::new(7, 0),
            Bytes::from_static(b"ping"),
        )
        .unwrap();

        let reply = handler.reply(&request).unwrap();
        assert_eq!(reply.head.command, request.head.command);
        assert_eq!(reply.head.status, StatusRecord::new(7, STATUS_OK));
        assert_eq!(reply.content, request.content);

        let mut corrupted = request.clone();
        corrupted.head.check = CheckRecord::new(0, 0);
        let reply = handler.reply(&corrupted).unwrap();
        assert_eq!(reply.head.status.status, STATUS_CHECK_FAILED);
        assert!(reply.verify_check());
        assert!(reply.is_valid());
    }
}

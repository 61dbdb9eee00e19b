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

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Listens for the server-wide shutdown broadcast.
///
/// A dropped sender counts as a shutdown signal, so connection tasks never outlive the
/// server that spawned them.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // Ok, Closed and Lagged all mean a signal was sent or can no longer arrive
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }

    /// Non-blocking check, for loops that poll between units of work.
    pub fn try_recv(&mut self) -> bool {
        if self.is_shutdown {
            return true;
        }
        match self.notify.try_recv() {
            Err(TryRecvError::Empty) => false,
            Ok(()) | Err(TryRecvError::Closed) | Err(TryRecvError::Lagged(_)) => {
                self.is_shutdown = true;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_and_dropped_sender_both_shut_down() {
        let (notify, _) = broadcast::channel(1);
        let mut first = Shutdown::new(notify.subscribe());
        let mut second = Shutdown::new(notify.subscribe());

        assert!(!first.try_recv());
        notify.send(()).unwrap();
        first.recv().await;
        assert!(first.is_shutdown());
        assert!(second.try_recv());

        let (notify, _) = broadcast::channel::<()>(1);
        let mut orphan = Shutdown::new(notify.subscribe());
        drop(notify);
        orphan.recv().await;
        assert!(orphan.is_shutdown());
    }
}

//! SSH Session

use russh::client::Handle;
use tracing::info;

use super::client::ClientHandler;
use super::handle_owner::{spawn_handle_owner_task, HandleController};

/// Authenticated SSH session
///
/// Holds the Handle until `start()` moves it into the Handle Owner Task.
/// After that the returned `HandleController` is the only way to reach it.
pub struct SshSession {
    handle: Handle<ClientHandler>,
    endpoint: String,
}

impl SshSession {
    pub fn new(handle: Handle<ClientHandler>, endpoint: String) -> Self {
        Self { handle, endpoint }
    }

    /// `host:port` this session is connected to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Start the Handle Owner Task and return a controller
    pub fn start(self) -> HandleController {
        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting handle owner task for session {} ({})",
            session_id, self.endpoint
        );
        spawn_handle_owner_task(self.handle, session_id)
    }
}

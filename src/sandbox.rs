use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::CoordinatorError;

/// Seam between the session manager and the external sandbox scripts.
///
/// Both operations are fire-and-forget at the process level: start returns
/// once the child is spawned, not once the sandbox is ready to serve.
#[async_trait]
pub trait SandboxControl: Send + Sync {
    async fn start(
        &self,
        session_id: &str,
        video_port: u16,
        audio_port: u16,
        input_port: u16,
    ) -> Result<(), CoordinatorError>;

    async fn stop(&self, session_id: &str) -> Result<(), CoordinatorError>;
}

/// Drives the sandbox through the configured startVM/stopVM shell entry
/// points, passing the session id and ports as positional arguments.
pub struct ScriptSandbox {
    start_script: PathBuf,
    stop_script: PathBuf,
}

impl ScriptSandbox {
    pub fn new(start_script: PathBuf, stop_script: PathBuf) -> Self {
        Self { start_script, stop_script }
    }
}

#[async_trait]
impl SandboxControl for ScriptSandbox {
    async fn start(
        &self,
        session_id: &str,
        video_port: u16,
        audio_port: u16,
        input_port: u16,
    ) -> Result<(), CoordinatorError> {
        info!(
            "[{}] spinning up sandbox (video={}, audio={}, input={})",
            session_id, video_port, audio_port, input_port
        );

        let mut child = Command::new(&self.start_script)
            .arg(session_id)
            .arg(video_port.to_string())
            .arg(audio_port.to_string())
            .arg(input_port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(CoordinatorError::SandboxLaunch)?;

        // Reap the launcher from a detached task; teardown never waits on it.
        let id = session_id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("[{}] sandbox launcher exited: {}", id, status),
                Err(e) => debug!("[{}] sandbox launcher wait failed: {}", id, e),
            }
        });

        Ok(())
    }

    async fn stop(&self, session_id: &str) -> Result<(), CoordinatorError> {
        info!("[{}] stopping sandbox", session_id);

        let mut child = Command::new(&self.stop_script)
            .arg(session_id)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(CoordinatorError::SandboxStop)?;

        let id = session_id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("[{}] sandbox stopper exited: {}", id, status),
                Err(e) => debug!("[{}] sandbox stopper wait failed: {}", id, e),
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_spawns_existing_command() {
        let sandbox = ScriptSandbox::new(PathBuf::from("true"), PathBuf::from("true"));
        sandbox.start("s1", 5004, 5006, 9090).await.unwrap();
        sandbox.stop("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_surfaces_launch_error() {
        let sandbox = ScriptSandbox::new(
            PathBuf::from("./no-such-start-script.sh"),
            PathBuf::from("./no-such-stop-script.sh"),
        );
        let err = sandbox.start("s1", 1, 2, 3).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::SandboxLaunch(_)));
        let err = sandbox.stop("s1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::SandboxStop(_)));
    }
}

//! Environment creation: the seam between the controller and the sandbox
//! machinery.
//!
//! An environment is one relay+worker pair reachable over a channel pair.
//! The controller only ever sees this handle; everything behind it is
//! replaceable, which is what the factory trait is for (the task-based stack
//! in production, scripted environments in failure-path tests).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use pipeforge_core::config::SandboxSettings;
use pipeforge_core::{ControllerMessage, Result, WorkerMessage};

use crate::relay::run_relay;
use crate::resolver::ScriptResolver;

/// A live isolated execution environment, as seen from the privileged side.
pub struct Environment {
    tx: mpsc::Sender<WorkerMessage>,
    rx: Option<mpsc::Receiver<ControllerMessage>>,
    supervisor: JoinHandle<()>,
}

impl Environment {
    /// Assemble an environment from its boundary channels and the task
    /// supervising them. Dropping the environment aborts the supervisor,
    /// which releases the worker in turn.
    pub fn new(
        tx: mpsc::Sender<WorkerMessage>,
        rx: mpsc::Receiver<ControllerMessage>,
        supervisor: JoinHandle<()>,
    ) -> Self {
        Self {
            tx,
            rx: Some(rx),
            supervisor,
        }
    }

    /// The worker-bound sender.
    pub fn sender(&self) -> mpsc::Sender<WorkerMessage> {
        self.tx.clone()
    }

    /// The controller-bound receiver; taken once by the message listener.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<ControllerMessage>> {
        self.rx.take()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

/// Creates isolated execution environments.
#[async_trait]
pub trait EnvironmentFactory: Send + Sync {
    async fn create(&self, settings: &SandboxSettings) -> Result<Environment>;
}

/// The production factory: boots a relay task owning a worker task, joined to
/// the controller by bounded channels.
pub struct TaskEnvironmentFactory {
    resolver: Arc<dyn ScriptResolver>,
}

impl TaskEnvironmentFactory {
    pub fn new(resolver: Arc<dyn ScriptResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl EnvironmentFactory for TaskEnvironmentFactory {
    async fn create(&self, settings: &SandboxSettings) -> Result<Environment> {
        let (worker_bound_tx, worker_bound_rx) = mpsc::channel(settings.channel_capacity);
        let (controller_bound_tx, controller_bound_rx) = mpsc::channel(settings.channel_capacity);
        let supervisor = tokio::spawn(run_relay(
            worker_bound_rx,
            controller_bound_tx,
            Arc::clone(&self.resolver),
            settings.channel_capacity,
        ));
        tracing::info!("sandbox environment created");
        Ok(Environment::new(
            worker_bound_tx,
            controller_bound_rx,
            supervisor,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;

    #[tokio::test]
    async fn created_environment_announces_readiness() {
        let factory =
            TaskEnvironmentFactory::new(Arc::new(StaticResolver::new()) as Arc<dyn ScriptResolver>);
        let mut environment = factory.create(&SandboxSettings::default()).await.unwrap();
        let mut rx = environment.take_receiver().expect("receiver available once");
        assert!(matches!(
            rx.recv().await,
            Some(ControllerMessage::Initialized)
        ));
        assert!(environment.take_receiver().is_none());
    }
}

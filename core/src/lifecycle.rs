use std::fmt;
use std::future::Future;

use tokio::sync::watch;
use tracing::debug;

use crate::errors::ReceiverError;

/// Lifecycle states of a receiver.
///
/// ```text
/// Created -> Connecting -> Subscribing -> Running -> Stopping -> Stopped
///                 \             \
///                  +-------------+--> Errored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Created,
    Connecting,
    Subscribing,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl LifecycleStatus {
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            LifecycleStatus::Created | LifecycleStatus::Stopped | LifecycleStatus::Errored
        )
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleStatus::Created => "created",
            LifecycleStatus::Connecting => "connecting",
            LifecycleStatus::Subscribing => "subscribing",
            LifecycleStatus::Running => "running",
            LifecycleStatus::Stopping => "stopping",
            LifecycleStatus::Stopped => "stopped",
            LifecycleStatus::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Receives progress reports while a component starts or stops.
pub trait ProgressMonitor: Send + Sync {
    fn progress(&self, component: &str, message: &str);
}

/// Reports progress through `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressMonitor;

impl ProgressMonitor for TracingProgressMonitor {
    fn progress(&self, component: &str, message: &str) {
        debug!(component, "{}", message);
    }
}

/// A component started and stopped by the owning framework, once per activation cycle.
pub trait LifecycleComponent {
    fn start(
        &mut self,
        monitor: &dyn ProgressMonitor,
    ) -> impl Future<Output = Result<(), ReceiverError>> + Send;

    /// Always completes; teardown failures are logged, not returned.
    fn stop(&mut self, monitor: &dyn ProgressMonitor) -> impl Future<Output = ()> + Send;

    fn status(&self) -> LifecycleStatus;

    fn display_name(&self) -> String;
}

/// Resolves once the flag carried by `signal` becomes true or its sender is dropped.
pub(crate) async fn signalled(signal: &mut watch::Receiver<bool>) {
    loop {
        let raised = *signal.borrow_and_update();
        if raised {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_can_start() {
        assert!(LifecycleStatus::Created.can_start());
        assert!(LifecycleStatus::Stopped.can_start());
        assert!(LifecycleStatus::Errored.can_start());
        assert!(!LifecycleStatus::Running.can_start());
        assert!(!LifecycleStatus::Connecting.can_start());
        assert_eq!(LifecycleStatus::Subscribing.to_string(), "subscribing");
    }

    #[tokio::test]
    async fn test_signalled_on_raise() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { signalled(&mut rx).await });
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("signal not observed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_signalled_on_sender_drop() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), signalled(&mut rx))
            .await
            .expect("dropped sender should resolve");
    }
}

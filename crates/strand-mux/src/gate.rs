//! Flow-control admission gate
//!
//! A counting permit primitive with a FIFO wait queue, used by both
//! multiplexers to cap the number of concurrently in-flight streams of a
//! class when the peer requires serialized dispatch. Built on tokio's fair
//! semaphore; `abort` fails every current and future waiter, which is how
//! connection teardown unblocks streams parked on admission.

use crate::error::MuxError;
use std::sync::Mutex;
use tokio::sync::Semaphore;
use tracing::trace;

#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Semaphore,
    cause: Mutex<Option<MuxError>>,
}

impl AdmissionGate {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Semaphore::new(permits),
            cause: Mutex::new(None),
        }
    }

    /// Take one permit, suspending until one is available
    ///
    /// Waiters are admitted in the order they arrived. Fails with the abort
    /// cause once the gate has been aborted.
    pub async fn acquire(&self) -> Result<(), MuxError> {
        match self.semaphore.acquire().await {
            Ok(permit) => {
                permit.forget();
                trace!("admission permit acquired");
                Ok(())
            }
            Err(_) => Err(self.abort_cause()),
        }
    }

    /// Return one permit, waking the oldest waiter
    ///
    /// Safe to call from any context, including abort paths.
    pub fn release(&self) {
        self.semaphore.add_permits(1);
        trace!("admission permit released");
    }

    /// Fail all pending and future `acquire` calls with `error`
    pub fn abort(&self, error: MuxError) {
        *self.cause.lock().unwrap() = Some(error);
        self.semaphore.close();
    }

    /// Permits currently available
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn abort_cause(&self) -> MuxError {
        self.cause
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(MuxError::ConnectionLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_release() {
        let gate = AdmissionGate::new(1);
        gate.acquire().await.unwrap();
        assert_eq!(gate.available(), 0);
        gate.release();
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_fifo_admission_order() {
        let gate = Arc::new(AdmissionGate::new(1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        // Holder keeps the single permit while A, B and C queue up
        gate.acquire().await.unwrap();

        let mut tasks = Vec::new();
        for label in ["A", "B", "C"] {
            let gate = gate.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                gate.acquire().await.unwrap();
                order.lock().unwrap().push(label);
                gate.release();
            }));
            // Let this waiter enqueue before spawning the next one
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        gate.release();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_abort_fails_waiters() {
        let gate = Arc::new(AdmissionGate::new(1));
        gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate.abort(MuxError::ConnectionClosed("teardown".to_string()));

        assert!(matches!(
            waiter.await.unwrap(),
            Err(MuxError::ConnectionClosed(_))
        ));
        // Future acquires fail with the same cause
        assert!(matches!(
            gate.acquire().await,
            Err(MuxError::ConnectionClosed(_))
        ));
    }
}

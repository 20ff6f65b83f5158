//! A lock/unlock style async mutex.
//!
//! Unlike `tokio::sync::Mutex` there is no guard: ownership is released with an explicit
//! [`AsyncMutex::unlock`], and releasing a mutex nobody holds is an error. Waiters are served in
//! the order they started waiting. [`AsyncMutex::run_exclusive`] is the exception and releases
//! the mutex even when its future is dropped or panics.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use snafu::Snafu;
use tokio::sync::Semaphore;

/// Errors raised by [`AsyncMutex`].
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum MutexError {
    /// `unlock` was called while the mutex was not held.
    #[snafu(display("Mutex is not locked"))]
    IllegalState,

    /// The underlying semaphore was closed.
    #[snafu(display("Mutex was closed"))]
    Closed,
}

/// Single-owner critical section with FIFO hand-over.
#[derive(Debug)]
pub struct AsyncMutex {
    permits: Semaphore,
    release: Mutex<()>,
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncMutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(1),
            release: Mutex::new(()),
        }
    }

    /// Waits until the mutex is free and takes ownership of it.
    pub async fn lock(&self) -> Result<(), MutexError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MutexError::Closed)?;
        permit.forget();
        Ok(())
    }

    /// Releases ownership, handing it to the longest waiting caller if there is one.
    pub fn unlock(&self) -> Result<(), MutexError> {
        let _release = self.release.lock().unwrap_or_else(PoisonError::into_inner);
        if self.permits.available_permits() > 0 {
            return Err(MutexError::IllegalState);
        }
        self.permits.add_permits(1);
        Ok(())
    }

    /// Whether someone currently owns the mutex.
    pub fn is_locked(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Runs `future` while holding the mutex and releases it afterwards, whatever the outcome.
    ///
    /// Cancelling the returned future or panicking inside `future` also releases the mutex.
    pub async fn run_exclusive<F, T>(&self, future: F) -> Result<T, MutexError>
    where
        F: Future<Output = T>,
    {
        self.lock().await?;
        let held = Held {
            mutex: self,
            armed: true,
        };
        let output = future.await;
        held.release()?;
        Ok(output)
    }
}

/// Ownership taken by `run_exclusive`, given back on drop unless already released.
struct Held<'a> {
    /// The owned mutex.
    mutex: &'a AsyncMutex,
    /// Cleared once the mutex was released explicitly.
    armed: bool,
}

impl Held<'_> {
    /// Gives the mutex back now, reporting an unlock that was not expected.
    fn release(mut self) -> Result<(), MutexError> {
        self.armed = false;
        self.mutex.unlock()
    }
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.mutex.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex as TokioMutex;
    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn holders_run_one_after_another() {
        let mutex = Arc::new(AsyncMutex::new());
        let values = Arc::new(TokioMutex::new(Vec::new()));

        let first = {
            let mutex = mutex.clone();
            let values = values.clone();
            tokio::spawn(async move {
                mutex.lock().await.unwrap();
                sleep(Duration::from_millis(50)).await;
                values.lock().await.push(222);
                mutex.unlock().unwrap();
            })
        };
        sleep(Duration::from_millis(5)).await;

        let second = {
            let mutex = mutex.clone();
            let values = values.clone();
            tokio::spawn(async move {
                mutex.lock().await.unwrap();
                values.lock().await.push(444);
                mutex.unlock().unwrap();
            })
        };

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(*values.lock().await, vec![222, 444]);
    }

    #[tokio::test]
    async fn unlocking_an_unlocked_mutex_fails() {
        let mutex = AsyncMutex::new();
        assert_eq!(mutex.unlock(), Err(MutexError::IllegalState));

        mutex.lock().await.unwrap();
        assert!(mutex.unlock().is_ok());
        assert_eq!(mutex.unlock(), Err(MutexError::IllegalState));
    }

    #[tokio::test]
    async fn critical_sections_never_overlap() {
        let mutex = Arc::new(AsyncMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8)
            .map(|_| {
                let mutex = mutex.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                tokio::spawn(async move {
                    mutex
                        .run_exclusive(async {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            sleep(Duration::from_millis(2)).await;
                            inside.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                        .unwrap();
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!mutex.is_locked());
    }

    #[tokio::test]
    async fn cancelled_critical_section_releases_the_mutex() {
        let mutex = AsyncMutex::new();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            mutex.run_exclusive(std::future::pending::<()>()),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(!mutex.is_locked());

        tokio::time::timeout(Duration::from_millis(100), mutex.lock())
            .await
            .expect("mutex stayed locked")
            .unwrap();
        mutex.unlock().unwrap();
    }

    #[tokio::test]
    async fn panicking_critical_section_releases_the_mutex() {
        let mutex = Arc::new(AsyncMutex::new());

        let task = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                mutex
                    .run_exclusive(async { panic!("boom") })
                    .await
                    .unwrap();
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert!(!mutex.is_locked());
        assert_eq!(mutex.run_exclusive(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let mutex = Arc::new(AsyncMutex::new());
        let order = Arc::new(TokioMutex::new(Vec::new()));
        mutex.lock().await.unwrap();

        let mut tasks = Vec::new();
        for id in 0..4 {
            let mutex = mutex.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                mutex.lock().await.unwrap();
                order.lock().await.push(id);
                mutex.unlock().unwrap();
            }));
            // let each task park on the semaphore before spawning the next
            sleep(Duration::from_millis(5)).await;
        }

        mutex.unlock().unwrap();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }
}

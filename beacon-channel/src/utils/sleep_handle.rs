use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::time::Instant;

/// An optional sleep that never completes while idle.
///
/// Can be polled in a `select!` loop. Once the deadline elapses, the handle resolves once and
/// stays idle until it is set again.
#[derive(Debug, Default)]
pub struct SleepHandle(Option<Pin<Box<tokio::time::Sleep>>>);

impl SleepHandle {
    /// Creates an idle handle.
    pub fn idle() -> Self {
        Self(None)
    }

    /// Cancels a pending deadline.
    pub fn reset(&mut self) {
        self.0 = None;
    }

    /// Sets the deadline, replacing a previous one.
    pub fn set_until(&mut self, deadline: Instant) {
        match &mut self.0 {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.0 = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }

    /// Returns the current deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.0.as_ref().map(|sleep| sleep.deadline())
    }

    /// Returns `true` if no deadline is set.
    pub fn is_idle(&self) -> bool {
        self.0.is_none()
    }
}

impl Future for SleepHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(sleep) = &mut this.0 else {
            return Poll::Pending;
        };

        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.0 = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_resolves_once() {
        let mut handle = SleepHandle::idle();
        assert!(handle.is_idle());

        let start = Instant::now();
        handle.set_until(start + Duration::from_secs(5));
        handle.set_until(start + Duration::from_secs(2));
        assert_eq!(handle.deadline(), Some(start + Duration::from_secs(2)));

        (&mut handle).await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(handle.is_idle());

        let idle = tokio::time::timeout(Duration::from_secs(60), &mut handle).await;
        assert!(idle.is_err());
    }
}

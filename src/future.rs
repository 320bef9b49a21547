// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-shot request outcomes.
//!
//! Transactional operations hand back a [`DriverFuture`] immediately and
//! resolve it later, once the corresponding wire traffic is done. The
//! resolving side holds the matching [`Completer`]; completing it consumes
//! it, so every future is resolved at most once by construction. A future
//! whose completer is dropped without being resolved yields
//! [`DriverError::FutureDropped`] instead of hanging forever.
//!
//! # Examples
//!
//! ```
//! use mqttconv::future::DriverFuture;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> mqttconv::Result<()> {
//! let (completer, future) = DriverFuture::pair();
//! completer.succeed("dev1".to_string());
//! assert_eq!(future.await?, "dev1");
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{DriverError, Error, Result};

/// The resolving half of a [`DriverFuture`].
///
/// Completing consumes the completer, so a request outcome can be delivered
/// exactly once. Dropping a completer unresolved fails the paired future with
/// [`DriverError::FutureDropped`].
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Completer<T> {
    /// Resolves the paired future with `result`.
    ///
    /// If the future was already dropped the outcome is discarded.
    pub fn complete(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }

    /// Resolves the paired future with `Ok(value)`.
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    /// Resolves the paired future with `Err(error)`.
    pub fn fail(self, error: Error) {
        self.complete(Err(error));
    }
}

/// The waiting half of a request issued to the driver or its backend.
///
/// Awaiting the future yields the outcome the [`Completer`] delivered. The
/// future is single-use: awaiting consumes it.
#[derive(Debug)]
pub struct DriverFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> DriverFuture<T> {
    /// Creates a linked completer/future pair.
    #[must_use]
    pub fn pair() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (Completer { tx }, Self { rx })
    }

    /// Creates an already-resolved future.
    ///
    /// Used when an operation can be rejected or answered without any wire
    /// traffic; awaiting it returns `result` immediately.
    #[must_use]
    pub fn ready(result: Result<T>) -> Self {
        let (completer, future) = Self::pair();
        completer.complete(result);
        future
    }

    /// Awaits the outcome, giving up after `timeout`.
    ///
    /// Yields [`DriverError::Timeout`] if the completer has not resolved the
    /// future within the given duration.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout.into()),
        }
    }

    /// Blocks the current thread until the outcome arrives.
    ///
    /// Must not be called from an asynchronous context; use `.await` there.
    pub fn wait_blocking(self) -> Result<T> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(DriverError::FutureDropped.into()),
        }
    }
}

impl<T> Future for DriverFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|recv| match recv {
            Ok(result) => result,
            Err(_) => Err(DriverError::FutureDropped.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_once_with_value() {
        let (completer, future) = DriverFuture::pair();
        completer.succeed(7_u32);
        assert_eq!(future.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn resolves_with_error() {
        let (completer, future) = DriverFuture::<()>::pair();
        completer.fail(DriverError::EventQueueFull.into());
        assert!(matches!(
            future.await,
            Err(Error::Driver(DriverError::EventQueueFull))
        ));
    }

    #[tokio::test]
    async fn dropped_completer_fails_future() {
        let (completer, future) = DriverFuture::<()>::pair();
        drop(completer);
        assert!(matches!(
            future.await,
            Err(Error::Driver(DriverError::FutureDropped))
        ));
    }

    #[tokio::test]
    async fn ready_future_is_immediate() {
        let future = DriverFuture::ready(Ok("x".to_string()));
        assert_eq!(future.await.unwrap(), "x");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_elapses() {
        let (completer, future) = DriverFuture::<()>::pair();
        let outcome = future.wait_timeout(Duration::from_millis(50)).await;
        assert!(matches!(
            outcome,
            Err(Error::Driver(DriverError::Timeout))
        ));
        drop(completer);
    }
}

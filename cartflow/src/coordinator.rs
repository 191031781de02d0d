//! Update coordinator gates a single cart mutation and dispatches it downstream.
//!
//! Every call goes through the same steps:
//!
//! ```text
//! Received -> Validating -> Rejected
//!                        -> Accepted -> Dispatched
//! ```
//!
//! Validation is synchronous from the caller's point of view. Dispatch is not: once the
//! validator accepts the mutation, the coordinator submits one detached task that pushes the
//! mutation to the sink, and returns as soon as the task is submitted. The task is neither
//! awaited nor cancellable, and nothing it does is reported back to the caller. A sink failure
//! is only visible through the sink itself and through the `warn` log emitted by the task.
//!
//! The coordinator holds no cart state. It can be cloned freely and any number of instances
//! can run side by side. It does not order concurrent calls for the same cart: callers that
//! need in-order application issue one call at a time per cart, and ordering downstream is
//! provided by the partitioning of the publish path.
use crate::model::MutationAction;
use crate::sink::EventSink;
use crate::validator::Validator;
use std::sync::Arc;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// Represents the ways `update_cart` can fail.
///
/// All of them are reported before anything is dispatched.
#[derive(thiserror::Error, Debug)]
pub enum Error<VE> {
    #[error("cart id must not be empty")]
    InvalidCartId,
    /// The validator declined the mutation.
    #[error("mutation of cart {cart_id} rejected")]
    Rejected {
        cart_id: String,
        #[source]
        reason: Option<VE>,
    },
    /// The dispatch task could not be submitted.
    #[error("unable to dispatch mutation of cart {cart_id}: {source}")]
    Dispatch {
        cart_id: String,
        #[source]
        source: TryCurrentError,
    },
}

/// Update coordinator configuration
///
/// # Properties:
///
/// * `max_in_flight`: the maximum number of sink pushes running at the same time. Extra
///   dispatch tasks wait for a free slot; the caller never does. `None` leaves dispatch
///   unbounded.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    max_in_flight: Option<usize>,
}

impl CoordinatorConfig {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight.max(1));
        self
    }

    pub fn max_in_flight(&self) -> Option<usize> {
        self.max_in_flight
    }
}

/// Validates cart mutations and dispatches the accepted ones to an event sink.
pub struct UpdateCoordinator<V, K> {
    validator: Arc<V>,
    sink: Arc<K>,
    in_flight: Option<Arc<Semaphore>>,
}

impl<V, K> Clone for UpdateCoordinator<V, K> {
    fn clone(&self) -> Self {
        Self {
            validator: Arc::clone(&self.validator),
            sink: Arc::clone(&self.sink),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<V, K> UpdateCoordinator<V, K>
where
    V: Validator,
    K: EventSink,
{
    /// Creates a coordinator with unbounded dispatch.
    pub fn new(validator: V, sink: K) -> Self {
        Self::with_config(validator, sink, CoordinatorConfig::default())
    }

    pub fn with_config(validator: V, sink: K, config: CoordinatorConfig) -> Self {
        Self {
            validator: Arc::new(validator),
            sink: Arc::new(sink),
            in_flight: config
                .max_in_flight
                .map(|permits| Arc::new(Semaphore::new(permits))),
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Validates a mutation of `cart_id` and dispatches it if accepted.
    ///
    /// # Arguments
    ///
    /// * `cart_id` - The cart to mutate.
    /// * `action` - The mutation.
    ///
    /// # Returns
    ///
    /// `Ok(())` once the dispatch task has been submitted; the sink may not have been called
    /// yet. Exactly one push is attempted per successful call. On error nothing is dispatched.
    ///
    /// # Notes
    ///
    /// Dispatch runs on the current Tokio runtime. Outside of one, the call fails with
    /// [`Error::Dispatch`].
    #[instrument(skip(self, action), fields(product_id = %action.product_id()))]
    pub async fn update_cart(
        &self,
        cart_id: &str,
        action: MutationAction,
    ) -> Result<(), Error<V::Error>> {
        if cart_id.is_empty() {
            return Err(Error::InvalidCartId);
        }

        match self.validator.soft_validation(cart_id, &action).await {
            Ok(true) => debug!("mutation accepted"),
            Ok(false) => {
                debug!("mutation rejected");
                return Err(Error::Rejected {
                    cart_id: cart_id.to_string(),
                    reason: None,
                });
            }
            Err(reason) => {
                debug!(%reason, "mutation rejected");
                return Err(Error::Rejected {
                    cart_id: cart_id.to_string(),
                    reason: Some(reason),
                });
            }
        }

        let runtime = Handle::try_current().map_err(|source| Error::Dispatch {
            cart_id: cart_id.to_string(),
            source,
        })?;
        let sink = Arc::clone(&self.sink);
        let in_flight = self.in_flight.clone();
        let cart_id = cart_id.to_string();
        runtime.spawn(async move {
            let _permit = match in_flight {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            if let Err(err) = sink.push_cart_sync(cart_id.clone(), action).await {
                warn!(cart_id = %cart_id, error = %err, "cart mutation dispatch failed");
            }
        });
        debug!("mutation dispatched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use crate::validator::{StructuralValidator, ValidationError};
    use assert2::{check, let_assert};
    use std::time::Duration;
    use tokio::sync::Notify;

    const WAIT: Duration = Duration::from_secs(5);

    fn accept_all(_: &str, _: &MutationAction) -> Result<bool, ValidationError> {
        Ok(true)
    }

    fn decline_all(_: &str, _: &MutationAction) -> Result<bool, ValidationError> {
        Ok(false)
    }

    #[tokio::test]
    async fn it_dispatches_an_accepted_mutation_exactly_once() {
        let sink = RecordingSink::new();
        let coordinator = UpdateCoordinator::new(StructuralValidator, sink.clone());

        coordinator
            .update_cart("user_1", MutationAction::new("P001", 1))
            .await
            .unwrap();

        check!(sink.wait_for(1, WAIT).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        check!(sink.pushes() == vec![("user_1".to_string(), MutationAction::new("P001", 1))]);
    }

    #[tokio::test]
    async fn it_dispatches_nothing_when_the_validator_declines() {
        let sink = RecordingSink::new();
        let coordinator = UpdateCoordinator::new(decline_all, sink.clone());

        let result = coordinator
            .update_cart("user_1", MutationAction::new("P001", 1))
            .await;

        let_assert!(Err(Error::Rejected { cart_id, reason: None }) = result);
        check!(cart_id == "user_1");
        check!(!sink.wait_for(1, Duration::from_millis(50)).await);
        check!(sink.pushes().is_empty());
    }

    #[tokio::test]
    async fn it_reports_the_validator_reason() {
        let sink = RecordingSink::new();
        let coordinator = UpdateCoordinator::new(StructuralValidator, sink.clone());

        let result = coordinator
            .update_cart("user_1", MutationAction::new("not a product", 1))
            .await;

        let_assert!(
            Err(Error::Rejected {
                reason: Some(ValidationError::InvalidProductId(product_id)),
                ..
            }) = result
        );
        check!(product_id == "not a product");
        check!(!sink.wait_for(1, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn it_rejects_an_empty_cart_id_without_consulting_the_validator() {
        let sink = RecordingSink::new();
        let validator = |_: &str, _: &MutationAction| -> Result<bool, ValidationError> {
            panic!("validator must not be called")
        };
        let coordinator = UpdateCoordinator::new(validator, sink.clone());

        let_assert!(
            Err(Error::InvalidCartId) = coordinator
                .update_cart("", MutationAction::new("P001", 1))
                .await
        );
        check!(sink.pushes().is_empty());
    }

    #[tokio::test]
    async fn it_dispatches_zero_adjustments() {
        let sink = RecordingSink::new();
        let coordinator = UpdateCoordinator::new(accept_all, sink.clone());

        coordinator
            .update_cart("user_1", MutationAction::new("P001", 0))
            .await
            .unwrap();

        check!(sink.wait_for(1, WAIT).await);
    }

    #[tokio::test]
    async fn it_succeeds_even_when_the_sink_fails() {
        let sink = RecordingSink::failing("broker unreachable");
        let coordinator = UpdateCoordinator::new(accept_all, sink.clone());

        let result = coordinator
            .update_cart("user_1", MutationAction::new("P001", 1))
            .await;

        check!(result.is_ok());
        check!(sink.wait_for(1, WAIT).await);
    }

    #[tokio::test]
    async fn it_returns_before_the_sink_completes() {
        let release = Arc::new(Notify::new());
        let sink = RecordingSink::new().blocked_on(release.clone());
        let coordinator = UpdateCoordinator::new(accept_all, sink.clone());

        tokio::time::timeout(
            WAIT,
            coordinator.update_cart("user_1", MutationAction::new("P001", 1)),
        )
        .await
        .expect("update_cart must not wait for the sink")
        .unwrap();
        check!(sink.completed() == 0);

        release.notify_one();
        check!(sink.wait_for_completed(1, WAIT).await);
    }

    #[tokio::test]
    async fn it_attempts_one_push_per_accepted_call() {
        let sink = RecordingSink::new();
        let coordinator = UpdateCoordinator::new(accept_all, sink.clone());

        for i in 0..10 {
            coordinator
                .clone()
                .update_cart("user_1", MutationAction::new(format!("P{i:03}"), 1))
                .await
                .unwrap();
        }

        check!(sink.wait_for(10, WAIT).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        check!(sink.pushes().len() == 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn it_caps_concurrent_pushes() {
        let release = Arc::new(Notify::new());
        let sink = RecordingSink::new().blocked_on(release.clone());
        let coordinator = UpdateCoordinator::with_config(
            accept_all,
            sink.clone(),
            CoordinatorConfig::unbounded().with_max_in_flight(2),
        );

        for i in 0..5 {
            coordinator
                .update_cart("user_1", MutationAction::new(format!("P{i:03}"), 1))
                .await
                .unwrap();
        }

        check!(sink.wait_for(2, WAIT).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        check!(sink.pushes().len() == 2);

        let mut rounds = 0;
        while sink.completed() < 5 && rounds < 1000 {
            release.notify_one();
            rounds += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check!(sink.completed() == 5);
        check!(sink.max_concurrent() <= 2);
    }

    #[test]
    fn it_fails_to_dispatch_outside_a_runtime() {
        let sink = RecordingSink::new();
        let coordinator = UpdateCoordinator::new(accept_all, sink.clone());

        let result = futures::executor::block_on(
            coordinator.update_cart("user_1", MutationAction::new("P001", 1)),
        );

        let_assert!(Err(Error::Dispatch { cart_id, .. }) = result);
        check!(cart_id == "user_1");
        check!(sink.pushes().is_empty());
    }
}

//! Validator performs the fast, local admissibility check of a mutation.
//!
//! The check is soft: it only rejects mutations that are structurally invalid or obviously
//! inadmissible, using information available locally. It must never perform the authoritative
//! write nor wait on distributed state, and a positive answer is not a durability guarantee.
use crate::model::MutationAction;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::error::Error as StdError;
use std::sync::Arc;

/// Decides whether a mutation may be dispatched.
#[async_trait]
pub trait Validator: Send + Sync {
    /// The error explaining a rejection.
    type Error: StdError + Send + Sync + 'static;

    /// Checks a mutation of `cart_id`.
    ///
    /// Returns `Ok(true)` to accept the mutation. Both `Ok(false)` and `Err(_)` reject it; an
    /// error additionally carries the reason reported to the caller.
    async fn soft_validation(
        &self,
        cart_id: &str,
        action: &MutationAction,
    ) -> Result<bool, Self::Error>;
}

#[async_trait]
impl<F, E> Validator for F
where
    F: Fn(&str, &MutationAction) -> Result<bool, E> + Send + Sync,
    E: StdError + Send + Sync + 'static,
{
    type Error = E;

    async fn soft_validation(&self, cart_id: &str, action: &MutationAction) -> Result<bool, E> {
        self(cart_id, action)
    }
}

/// Reasons a built-in validator rejects a mutation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cart id must not be empty")]
    EmptyCartId,
    #[error("invalid product id {0:?}")]
    InvalidProductId(String),
    #[error("cart {0} is unknown")]
    UnknownCart(String),
}

/// Rejects mutations with an empty cart id or a malformed product id.
///
/// A product id starts with an ASCII letter or digit, followed by letters, digits, `_`, `-`
/// or `.`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralValidator;

impl StructuralValidator {
    pub fn check(cart_id: &str, action: &MutationAction) -> Result<(), ValidationError> {
        if cart_id.is_empty() {
            return Err(ValidationError::EmptyCartId);
        }
        if !Self::is_valid_product_id(action.product_id()) {
            return Err(ValidationError::InvalidProductId(
                action.product_id().to_string(),
            ));
        }
        Ok(())
    }

    /// Determines whether a string is a well formed product id.
    pub fn is_valid_product_id(s: &str) -> bool {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-.]*$").unwrap();
        }
        RE.is_match(s)
    }
}

#[async_trait]
impl Validator for StructuralValidator {
    type Error = ValidationError;

    async fn soft_validation(
        &self,
        cart_id: &str,
        action: &MutationAction,
    ) -> Result<bool, Self::Error> {
        Self::check(cart_id, action).map(|_| true)
    }
}

/// Accepts structurally valid mutations of carts found in a local snapshot.
///
/// The snapshot is owned by the validator and shared between its clones; it is never
/// refreshed from remote state during a check.
#[derive(Debug, Clone, Default)]
pub struct KnownCartsValidator {
    carts: Arc<HashSet<String>>,
}

impl KnownCartsValidator {
    pub fn new<I, S>(carts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            carts: Arc::new(carts.into_iter().map(Into::into).collect()),
        }
    }

    pub fn knows(&self, cart_id: &str) -> bool {
        self.carts.contains(cart_id)
    }
}

#[async_trait]
impl Validator for KnownCartsValidator {
    type Error = ValidationError;

    async fn soft_validation(
        &self,
        cart_id: &str,
        action: &MutationAction,
    ) -> Result<bool, Self::Error> {
        StructuralValidator::check(cart_id, action)?;
        if !self.knows(cart_id) {
            return Err(ValidationError::UnknownCart(cart_id.to_string()));
        }
        Ok(true)
    }
}

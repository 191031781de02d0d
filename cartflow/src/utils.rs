#[cfg(test)]
pub mod tests {
    use async_trait::async_trait;
    use mockall::mock;

    use crate::{CartEntry, CartUpdateRequest, Envelope, Transport};

    #[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
    #[error("broker down")]
    pub struct BrokerDown;

    pub fn laptop_request(user_id: &str, version_number: u64) -> CartUpdateRequest {
        CartUpdateRequest::new(user_id, version_number)
            .with_entry(CartEntry::qty_change("P001", "Laptop", 1))
    }

    /// Two consecutive versions for each of four users, grouped by user.
    pub fn sample_batch() -> Vec<CartUpdateRequest> {
        (1..=4)
            .flat_map(|user| {
                (1..=2).map(move |version| laptop_request(&format!("user_{user}"), version))
            })
            .collect()
    }

    mock! {
        pub Transport {}
        #[async_trait]
        impl Transport for Transport {
            type Error = BrokerDown;
            async fn write_messages(&self, messages: Vec<Envelope>) -> Result<(), BrokerDown>;
        }
    }
}

//! Person endpoint: logs what it receives and never replies.

use async_trait::async_trait;
use tracing::info;

use crate::client::{EndpointError, Handler};

pub struct Person;

#[async_trait]
impl Handler for Person {
    async fn receive_message(
        &self,
        sender_id: &str,
        message: &str,
    ) -> Result<Option<String>, EndpointError> {
        info!("From {sender_id} received message: {message}");
        Ok(None)
    }
}

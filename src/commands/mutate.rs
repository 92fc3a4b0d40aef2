use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use tokio::sync::mpsc::UnboundedSender;

use crate::api::{ApiClient, Outcome};
use crate::app::AppMessage;
use crate::commands::Command;
use crate::dispatch::Dispatch;

/// Sends one dispatched mutation and reports its outcome.
pub struct ExecuteActionCmd {
    client: Arc<ApiClient>,
    dispatch: Dispatch,
}

impl ExecuteActionCmd {
    pub const fn new(client: Arc<ApiClient>, dispatch: Dispatch) -> Self {
        Self { client, dispatch }
    }
}

#[async_trait]
impl Command for ExecuteActionCmd {
    fn name(&self) -> String {
        format!(
            "Action {}: {} {}",
            self.dispatch.action,
            self.dispatch.operation.verb(),
            self.dispatch.target
        )
    }

    async fn execute(self: Box<Self>, action_tx: UnboundedSender<AppMessage>) -> Result<()> {
        let Dispatch {
            action,
            target,
            operation,
            idempotency_key,
        } = self.dispatch;
        let Outcome { result, retries } = self.client.execute(&target, &operation, idempotency_key).await;
        action_tx.send(AppMessage::ActionCompleted {
            action,
            result,
            retries,
        })?;
        Ok(())
    }
}

//! Async side effects that run outside the event loop.
//!
//! Screens and the app describe work as commands; the app spawns each one on
//! the runtime and the command reports back through [`AppMessage`]s.

mod clipboard;
mod fetch;
mod mutate;

use async_trait::async_trait;
use color_eyre::Result;
use tokio::sync::mpsc::UnboundedSender;

use crate::app::AppMessage;

pub use clipboard::CopyToClipboardCmd;
pub use fetch::{FetchCollectionCmd, FetchItemCmd};
pub use mutate::ExecuteActionCmd;

#[async_trait]
pub trait Command: Send + 'static {
    /// Human-readable name for logs.
    fn name(&self) -> String;

    async fn execute(self: Box<Self>, action_tx: UnboundedSender<AppMessage>) -> Result<()>;
}

use arboard::Clipboard;
use async_trait::async_trait;
use color_eyre::Result;
use tokio::sync::mpsc::UnboundedSender;

use crate::app::AppMessage;
use crate::commands::Command;
use crate::ui::ToastType;

/// Puts a resource id on the system clipboard.
pub struct CopyToClipboardCmd {
    text: String,
    what: String,
}

impl CopyToClipboardCmd {
    pub fn new(text: impl Into<String>, what: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            what: what.into(),
        }
    }
}

#[async_trait]
impl Command for CopyToClipboardCmd {
    fn name(&self) -> String {
        format!("Copying {}", self.what)
    }

    async fn execute(self: Box<Self>, action_tx: UnboundedSender<AppMessage>) -> Result<()> {
        let Self { text, what } = *self;
        // no clipboard on headless sessions; report instead of failing the command
        let copied = Clipboard::new().and_then(|mut clipboard| clipboard.set_text(text));
        let (message, toast_type) = match copied {
            Ok(()) => (format!("Copied {what}"), ToastType::Success),
            Err(err) => (format!("Could not copy {what}: {err}"), ToastType::Error),
        };
        action_tx.send(AppMessage::ShowToast { message, toast_type })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_outcome_is_reported_as_toast() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cmd = CopyToClipboardCmd::new("agent-42", "resource id");
        assert_eq!(cmd.name(), "Copying resource id");

        Box::new(cmd).execute(tx).await.unwrap();

        // headless runners have no clipboard, so either outcome is fine
        match rx.try_recv() {
            Ok(AppMessage::ShowToast { message, toast_type }) => {
                assert!(message.contains("resource id"), "{message}");
                match toast_type {
                    ToastType::Success => assert_eq!(message, "Copied resource id"),
                    ToastType::Error => assert!(message.starts_with("Could not copy resource id")),
                    ToastType::Info => panic!("unexpected info toast"),
                }
            }
            other => panic!("expected a toast, got {other:?}"),
        }
    }
}

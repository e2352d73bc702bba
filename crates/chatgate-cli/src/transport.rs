use async_trait::async_trait;
use chatgate_agents::Transport;
use chatgate_common::{ConversationId, MessageRef, Result};
use std::io::Write;
use std::sync::Mutex;

/// Prints answers to stdout as they grow; tool and error notices go to stderr.
///
/// A terminal cannot edit what it already printed, so each progress update only
/// appends the text not shown yet.
#[derive(Default)]
pub struct TerminalTransport {
    shown: Mutex<String>,
}

impl TerminalTransport {
    fn print_unshown(&self, text: &str) -> Result<()> {
        let mut shown = self.shown.lock().unwrap_or_else(|e| e.into_inner());
        let mut stdout = std::io::stdout().lock();
        match text.strip_prefix(shown.as_str()) {
            Some(rest) => stdout.write_all(rest.as_bytes())?,
            // The answer was rewritten; start over on a fresh line.
            None => {
                stdout.write_all(b"\n")?;
                stdout.write_all(text.as_bytes())?;
            }
        }
        stdout.flush()?;
        *shown = text.to_string();
        Ok(())
    }

    fn reset(&self) {
        self.shown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl Transport for TerminalTransport {
    async fn on_progress(
        &self,
        _conversation: &ConversationId,
        _existing: Option<&str>,
        text: &str,
    ) -> Result<MessageRef> {
        self.print_unshown(text)?;
        Ok("stdout".to_string())
    }

    async fn on_tool_started(
        &self,
        _conversation: &ConversationId,
        name: &str,
        args_summary: &str,
    ) -> Result<()> {
        eprintln!("[tool] {name} {args_summary}");
        Ok(())
    }

    async fn on_final(
        &self,
        _conversation: &ConversationId,
        _existing: Option<&str>,
        text: &str,
    ) -> Result<()> {
        self.print_unshown(text)?;
        println!();
        self.reset();
        Ok(())
    }

    async fn on_error(
        &self,
        _conversation: &ConversationId,
        existing: Option<&str>,
        message: &str,
    ) -> Result<()> {
        if existing.is_some() {
            println!();
        }
        eprintln!("error: {message}");
        self.reset();
        Ok(())
    }
}

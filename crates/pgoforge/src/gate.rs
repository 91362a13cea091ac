//! Operator confirmation before the expensive build.

use std::io::{self, BufRead, Write};

use crossterm::style::Stylize;
use crossterm::tty::IsTty;

use crate::error::{Error, Result};

pub trait ConfirmGate: Send + Sync {
    /// Shows `summary` and returns whether the operator accepted.
    fn confirm(&self, summary: &[String]) -> Result<bool>;
}

/// `--yes`.
pub struct AssumeYes;

impl ConfirmGate for AssumeYes {
    fn confirm(&self, summary: &[String]) -> Result<bool> {
        for line in summary {
            tracing::info!("{line}");
        }
        Ok(true)
    }
}

/// Declines every request.
pub struct Decline;

impl ConfirmGate for Decline {
    fn confirm(&self, _summary: &[String]) -> Result<bool> {
        Ok(false)
    }
}

/// Prompts on the controlling terminal; declines when stdin is not a terminal.
pub struct TerminalPrompt;

impl TerminalPrompt {
    fn accepts(answer: &str) -> bool {
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

impl ConfirmGate for TerminalPrompt {
    fn confirm(&self, summary: &[String]) -> Result<bool> {
        let stdin = io::stdin();
        if !stdin.is_tty() {
            tracing::warn!("no terminal for confirmation and --yes not given; declining");
            return Ok(false);
        }

        let mut out = io::stdout().lock();
        writeln!(out, "{}", "Resolved build".bold())?;
        for line in summary {
            writeln!(out, "  {line}")?;
        }
        write!(out, "{} ", "Proceed with the kernel build? [y/N]".yellow())?;
        out.flush()?;

        let mut answer = String::new();
        stdin
            .lock()
            .read_line(&mut answer)
            .map_err(|e| Error::msg(format!("failed to read confirmation: {e}")))?;
        Ok(Self::accepts(&answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_yes_accepts() {
        assert!(TerminalPrompt::accepts("y\n"));
        assert!(TerminalPrompt::accepts(" YES "));
        assert!(!TerminalPrompt::accepts("\n"));
        assert!(!TerminalPrompt::accepts("no"));
    }

    #[test]
    fn fixed_gates() {
        assert!(AssumeYes.confirm(&["mode: collection".into()]).expect("yes"));
        assert!(!Decline.confirm(&[]).expect("no"));
    }
}

//! User input
//!
//! [`TerminalPrompt`] renders `dialoguer` widgets on a blocking thread so the
//! runtime keeps driving tunnel tasks while the user is reading a menu.

use async_trait::async_trait;
use dialoguer::theme::{ColorfulTheme, SimpleTheme, Theme};
use dialoguer::{Confirm, Input, Select};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Prompt failed: {0}")]
    Terminal(#[from] dialoguer::Error),

    /// No more input will arrive (closed stdin, exhausted script)
    #[error("Input closed")]
    Closed,
}

#[async_trait]
pub trait Prompt: Send {
    /// Pick one of `items`; `None` when the user backs out (Esc)
    async fn select(&mut self, title: &str, items: &[String]) -> Result<Option<usize>, PromptError>;

    /// Free text, `default` used on empty input
    async fn input(&mut self, label: &str, default: Option<&str>) -> Result<String, PromptError>;

    async fn confirm(&mut self, label: &str, default: bool) -> Result<bool, PromptError>;

    /// Wait until the user has read the output above
    async fn pause(&mut self) -> Result<(), PromptError>;
}

/// Interactive terminal prompts
#[derive(Debug, Clone, Copy)]
pub struct TerminalPrompt {
    color: bool,
}

impl TerminalPrompt {
    pub fn new(color: bool) -> Self {
        Self { color }
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new(true)
    }
}

fn theme(color: bool) -> Box<dyn Theme> {
    if color {
        Box::new(ColorfulTheme::default())
    } else {
        Box::new(SimpleTheme)
    }
}

async fn blocking<T, F>(f: F) -> Result<T, PromptError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PromptError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| PromptError::Closed)?
}

#[async_trait]
impl Prompt for TerminalPrompt {
    async fn select(&mut self, title: &str, items: &[String]) -> Result<Option<usize>, PromptError> {
        let color = self.color;
        let title = title.to_string();
        let items = items.to_vec();
        blocking(move || {
            let theme = theme(color);
            Ok(Select::with_theme(theme.as_ref())
                .with_prompt(title)
                .items(&items)
                .default(0)
                .interact_opt()?)
        })
        .await
    }

    async fn input(&mut self, label: &str, default: Option<&str>) -> Result<String, PromptError> {
        let color = self.color;
        let label = label.to_string();
        let default = default.map(str::to_string);
        blocking(move || {
            let theme = theme(color);
            let mut input = Input::<String>::with_theme(theme.as_ref())
                .with_prompt(label)
                .allow_empty(true);
            if let Some(default) = default {
                input = input.default(default);
            }
            Ok(input.interact_text()?.trim().to_string())
        })
        .await
    }

    async fn confirm(&mut self, label: &str, default: bool) -> Result<bool, PromptError> {
        let color = self.color;
        let label = label.to_string();
        blocking(move || {
            let theme = theme(color);
            Ok(Confirm::with_theme(theme.as_ref())
                .with_prompt(label)
                .default(default)
                .interact()?)
        })
        .await
    }

    async fn pause(&mut self) -> Result<(), PromptError> {
        let color = self.color;
        blocking(move || {
            let theme = theme(color);
            Input::<String>::with_theme(theme.as_ref())
                .with_prompt("Press Enter to continue")
                .allow_empty(true)
                .report(false)
                .interact_text()?;
            Ok(())
        })
        .await
    }
}

//! Styled terminal output
//!
//! All session output goes through [`Console`]. A capturing console keeps the
//! lines instead of printing them, which is what the session tests assert on.

use colored::{ColoredString, Colorize};
use gcpvm_gateway::{CloudApiError, CloudErrorCode, PowerState};

const RULE_WIDTH: usize = 60;

#[derive(Debug, Default)]
pub struct Console {
    captured: Option<Vec<String>>,
}

impl Console {
    /// Console writing to stdout
    pub fn stdout() -> Self {
        Self { captured: None }
    }

    /// Console recording its output in memory
    pub fn capture() -> Self {
        Self {
            captured: Some(Vec::new()),
        }
    }

    /// Captured lines; empty for a stdout console
    pub fn lines(&self) -> &[String] {
        self.captured.as_deref().unwrap_or(&[])
    }

    /// Whether any captured line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }

    pub fn line(&mut self, text: impl Into<String>) {
        let text = text.into();
        match &mut self.captured {
            Some(lines) => lines.push(text),
            None => println!("{}", text),
        }
    }

    pub fn blank(&mut self) {
        self.line("");
    }

    /// Application header with the current local time
    pub fn header(&mut self, title: &str) {
        let rule = "=".repeat(RULE_WIDTH);
        self.blank();
        self.line(rule.cyan().bold().to_string());
        self.line(format!("{:^width$}", title, width = RULE_WIDTH).cyan().bold().to_string());
        self.line(rule.cyan().bold().to_string());
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.line(format!("Current time: {}", now).blue().to_string());
        self.blank();
    }

    pub fn section(&mut self, title: &str) {
        self.line(title.yellow().bold().to_string());
    }

    pub fn success(&mut self, message: &str) {
        self.line(format!("{} {}", "✓".green().bold(), message.green()));
    }

    pub fn warning(&mut self, message: &str) {
        self.line(format!("{} {}", "⚠".yellow().bold(), message.yellow()));
    }

    pub fn info(&mut self, message: &str) {
        self.line(format!("{} {}", "ℹ".blue().bold(), message));
    }

    /// Error banner
    pub fn error(&mut self, message: &str) {
        self.line(format!("{} {}", "✗".red().bold(), message.red()));
    }

    /// Error banner for a failed cloud call, with a hint when one applies
    pub fn cloud_error(&mut self, what: &str, err: &CloudApiError) {
        self.error(&format!("Failed to {}: {}", what, err.message));
        if let Some(hint) = hint(err.code) {
            self.line(format!("  {} {}", "→".cyan(), hint));
        }
    }

    /// Multi-line text, indented
    pub fn block(&mut self, text: &str) {
        for line in text.lines() {
            self.line(format!("  {}", line));
        }
    }
}

fn hint(code: CloudErrorCode) -> Option<&'static str> {
    match code {
        CloudErrorCode::Unauthenticated => Some("Run `gcloud auth login` and try again"),
        CloudErrorCode::PermissionDenied => {
            Some("Check that your account has the required IAM roles in this project")
        }
        CloudErrorCode::ToolUnavailable => {
            Some("Install the Google Cloud SDK or point --gcloud / GCPVM_GCLOUD at the binary")
        }
        CloudErrorCode::NotFound => Some("Verify the project id, zone and resource name"),
        CloudErrorCode::Network => Some("Check your network connection"),
        CloudErrorCode::QuotaExceeded
        | CloudErrorCode::InvalidResponse
        | CloudErrorCode::Unknown => None,
    }
}

/// `PRODUCTION` for ids mentioning production, `STAGING` otherwise
pub fn environment_tag(project: &str) -> ColoredString {
    if project.to_ascii_lowercase().contains("production") {
        "[PRODUCTION]".red().bold()
    } else {
        "[STAGING]".green()
    }
}

pub fn power_state(state: PowerState) -> ColoredString {
    paint_state(state.as_str(), state)
}

/// Power state padded to `width` before coloring
pub fn power_state_column(state: PowerState, width: usize) -> ColoredString {
    paint_state(&column(state.as_str(), width), state)
}

fn paint_state(text: &str, state: PowerState) -> ColoredString {
    match state {
        PowerState::Running => text.green(),
        PowerState::Stopped | PowerState::Terminated => text.red(),
        PowerState::Unknown => text.yellow(),
    }
}

/// Fixed-width column, truncated with an ellipsis
pub fn column(text: &str, width: usize) -> String {
    let count = text.chars().count();
    if count <= width {
        format!("{:<width$}", text, width = width)
    } else {
        let cut: String = text.chars().take(width.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

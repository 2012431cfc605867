use anyhow::{Context, Result};
use serde::Serialize;

/// How the CLI prints results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// Pretty-printed JSON on stdout.
    Json,
}

impl OutputFormat {
    pub const fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Text }
    }

    /// Print `data` as JSON, or call `text` to print it for humans.
    pub fn emit<T: Serialize>(self, data: &T, text: impl FnOnce(&T)) -> Result<()> {
        match self {
            Self::Json => {
                let rendered =
                    serde_json::to_string_pretty(data).context("JSON serialization failed")?;
                println!("{rendered}");
            }
            Self::Text => text(data),
        }
        Ok(())
    }
}

//! Confirmation prompts using dialoguer

use crate::utils::error::{ArchitectError, Result};
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm};

/// Prompt for yes/no confirmation
pub fn prompt_confirm(prompt: &str, default: bool) -> Result<bool> {
    let theme = ColorfulTheme::default();
    Confirm::with_theme(&theme)
        .with_prompt(prompt)
        .default(default)
        .interact_opt()
        .map_err(|e| ArchitectError::Io(std::io::Error::other(e.to_string())))?
        .ok_or(ArchitectError::UserCancelled)
}

/// Show a destructive-action warning and require an explicit yes.
///
/// Declining is reported as [`ArchitectError::UserCancelled`].
pub fn confirm_destruction(device: &str) -> Result<()> {
    println!();
    println!(
        "{}",
        format!("WARNING: all data on {} will be destroyed!", device)
            .red()
            .bold()
    );
    println!();

    if prompt_confirm("Continue?", false)? {
        Ok(())
    } else {
        Err(ArchitectError::UserCancelled)
    }
}

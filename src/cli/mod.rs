pub mod args;
pub mod jobs;
pub mod sessions;

pub use args::{Cli, CliCommand, ListCliArgs};
pub use jobs::handle_jobs_command;
pub use sessions::handle_sessions_command;

/// Cut `text` to at most `max` characters for one-line display.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

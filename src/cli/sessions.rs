use anyhow::Result;

use super::args::ListCliArgs;
use super::truncate;
use crate::db::{Database, SessionRepository};

pub fn handle_sessions_command(args: ListCliArgs) -> Result<()> {
    let db = Database::open_default()?;
    let sessions = SessionRepository::list(&*db.conn()?, args.limit)?;

    if sessions.is_empty() {
        println!("No recording sessions found.");
        return Ok(());
    }

    println!("Found {} session(s):\n", sessions.len());

    for session in sessions {
        println!("ID: {}", session.id);
        println!(
            "Title: {}",
            session.title.as_deref().unwrap_or("Manual session")
        );
        if let Some(event_id) = &session.event_id {
            println!("Event: {}", event_id);
        }
        println!("State: {}", session.state);
        println!(
            "Created: {}",
            session.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!("Audio: {:.1}s, {} marker(s)", session.audio_duration_secs, session.markers.len());
        if let Some(archive) = &session.archive {
            println!("Transcript: {}", archive.transcript_path.display());
            if let Some(translation) = &archive.translation_path {
                println!("Translation: {}", translation.display());
            }
        }
        if let Some(error) = &session.error {
            println!("Error: {}", truncate(error, 100));
        }
        println!("---");
    }

    Ok(())
}

//! Files written for a finished session.

use anyhow::{Context, Result};
use std::path::Path;

use super::status::{Marker, SessionArchive, TranscriptSegment, TranslatedSegment};

pub const TRANSCRIPT_FILE: &str = "transcript.txt";
pub const TRANSLATION_FILE: &str = "translation.txt";
pub const MARKERS_FILE: &str = "markers.json";

/// Write transcript, optional translation and markers into `session_dir`.
pub(crate) async fn write_archive(
    session_dir: &Path,
    transcript: &[TranscriptSegment],
    translation: Option<&[TranslatedSegment]>,
    markers: &[Marker],
) -> Result<SessionArchive> {
    tokio::fs::create_dir_all(session_dir)
        .await
        .with_context(|| format!("Failed to create session dir {:?}", session_dir))?;

    let transcript_path = session_dir.join(TRANSCRIPT_FILE);
    tokio::fs::write(&transcript_path, render_transcript(transcript))
        .await
        .context("Failed to write transcript")?;

    let translation_path = match translation {
        Some(segments) => {
            let path = session_dir.join(TRANSLATION_FILE);
            tokio::fs::write(&path, render_translation(transcript, segments))
                .await
                .context("Failed to write translation")?;
            Some(path)
        }
        None => None,
    };

    let markers_path = session_dir.join(MARKERS_FILE);
    let markers_json =
        serde_json::to_string_pretty(markers).context("Failed to encode markers")?;
    tokio::fs::write(&markers_path, markers_json)
        .await
        .context("Failed to write markers")?;

    Ok(SessionArchive {
        transcript_path,
        translation_path,
        markers_path,
    })
}

fn render_transcript(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|s| format!("[{}] {}\n", timestamp(s.start_secs), s.text))
        .collect()
}

/// Translated lines reuse the timestamp of the segment they came from.
fn render_translation(transcript: &[TranscriptSegment], translated: &[TranslatedSegment]) -> String {
    translated
        .iter()
        .map(|t| {
            let start = transcript
                .iter()
                .find(|s| s.index == t.index)
                .map_or(0.0, |s| s.start_secs);
            format!("[{}] {}\n", timestamp(start), t.text)
        })
        .collect()
}

fn timestamp(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn segment(index: usize, start: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            index,
            start_secs: start,
            end_secs: start + 1.0,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(timestamp(0.0), "00:00:00");
        assert_eq!(timestamp(3723.9), "01:02:03");
    }

    #[tokio::test]
    async fn test_archive_without_translation() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = vec![segment(0, 0.0, "hello"), segment(1, 65.0, "world")];
        let markers = vec![Marker {
            label: "intro".to_string(),
            offset_secs: 3.0,
            created_at: Utc::now(),
        }];

        let archive = write_archive(dir.path(), &transcript, None, &markers)
            .await
            .unwrap();
        assert!(archive.translation_path.is_none());

        let text = std::fs::read_to_string(&archive.transcript_path).unwrap();
        assert_eq!(text, "[00:00:00] hello\n[00:01:05] world\n");

        let stored: Vec<Marker> =
            serde_json::from_str(&std::fs::read_to_string(&archive.markers_path).unwrap()).unwrap();
        assert_eq!(stored, markers);
    }

    #[tokio::test]
    async fn test_translation_lines_follow_source_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = vec![segment(0, 0.0, "hola"), segment(1, 10.0, "adios")];
        let translated = vec![TranslatedSegment {
            index: 1,
            text: "bye".to_string(),
        }];

        let archive = write_archive(dir.path(), &transcript, Some(&translated), &[])
            .await
            .unwrap();
        let text = std::fs::read_to_string(archive.translation_path.unwrap()).unwrap();
        assert_eq!(text, "[00:00:10] bye\n");
    }
}

use orchestrator::OrchestratorEvent;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Transcript lines for one event: what the user said and what the robot says back.
pub fn transcript_lines(event: &OrchestratorEvent, at: OffsetDateTime) -> Vec<String> {
    let ts = at.format(&Rfc3339).unwrap_or_else(|_| at.unix_timestamp().to_string());
    match event {
        OrchestratorEvent::UtteranceReceived { utterance, .. } => {
            let said = if utterance.raw_text().is_empty() {
                format!("<{}>", utterance.intent())
            } else {
                utterance.raw_text().to_string()
            };
            vec![format!("{ts} | User: {said}")]
        }
        OrchestratorEvent::PlanStarted { plan, .. } => plan
            .speech()
            .map(|text| format!("{ts} | Robot: {text}"))
            .collect(),
        _ => Vec::new(),
    }
}

/// Append the conversation transcript to `path` until the event stream closes.
pub async fn run(path: &Path, mut events: broadcast::Receiver<OrchestratorEvent>) -> anyhow::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    info!(path = %path.display(), "writing interaction log");
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "interaction log fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        for line in transcript_lines(&event, OffsetDateTime::now_utc()) {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
    }
    Ok(())
}

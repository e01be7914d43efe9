use strata_core::Goal;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Read one goal per line until end of input. Blank lines are skipped.
pub async fn read_goals<R>(reader: R) -> eyre::Result<Vec<Goal>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut goals = Vec::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let goal: Goal = serde_json::from_str(line)
            .map_err(|e| eyre::eyre!("invalid goal on line {line_no}: {e}"))?;
        goals.push(goal);
    }
    tracing::debug!(count = goals.len(), "goals received");
    Ok(goals)
}

//! Bulk recipient source for `POST /notify/emails`.

use std::path::Path;

use courier_common::error::AppError;

/// Read the recipient list: the first comma-separated column of each line.
pub async fn read_recipients(path: impl AsRef<Path>) -> Result<Vec<String>, AppError> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        AppError::Internal(format!(
            "Failed to read recipients file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(parse_recipients(&contents))
}

/// Blank lines and blank first cells are skipped.
pub fn parse_recipients(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| line.split(',').next())
        .map(str::trim)
        .filter(|cell| !cell.is_empty())
        .map(str::to_string)
        .collect()
}

//! Review parser boundary
//!
//! Turning a raw page into reviews is done by a parser collaborator. The
//! pagination engine only looks at the batch's emptiness and date range.
//! [`CommandParser`] runs an external parser program: page content on stdin,
//! a JSON array of review objects on stdout. Each object needs either a
//! `reviewed_at` timestamp (RFC 3339) or a `review_date` (`YYYY-MM-DD`).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::models::{Review, ReviewBatch};

/// Errors from the parser collaborator
#[derive(Error, Debug)]
pub enum ParseError {
    /// Output could not be understood
    #[error("Invalid parser output: {0}")]
    Invalid(String),

    /// The parser program failed
    #[error("Parser command failed: {0}")]
    Command(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ReviewParser: Send + Sync {
    /// Parse one page into a batch of reviews
    async fn parse(&self, content: &str) -> Result<ReviewBatch, ParseError>;
}

/// [`ReviewParser`] delegating to an external program
pub struct CommandParser {
    program: String,
    args: Vec<String>,
}

impl CommandParser {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a command line split on whitespace
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl ReviewParser for CommandParser {
    async fn parse(&self, content: &str) -> Result<ReviewBatch, ParseError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ParseError::Command(format!("{}: {e}", self.program)))?;

        // stdin is written concurrently with draining stdout
        let writer = child.stdin.take().map(|mut stdin| {
            let content = content.to_owned();
            tokio::spawn(async move { stdin.write_all(content.as_bytes()).await })
        });

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(program = %self.program, error = %e, "Parser closed stdin early"),
                Err(e) => return Err(ParseError::Command(e.to_string())),
            }
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ParseError::Command(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        parse_review_json(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Decode a JSON array of review objects into a batch
pub fn parse_review_json(output: &str) -> Result<ReviewBatch, ParseError> {
    let value: Value =
        serde_json::from_str(output.trim()).map_err(|e| ParseError::Invalid(e.to_string()))?;
    let Value::Array(items) = value else {
        return Err(ParseError::Invalid("expected a JSON array".to_string()));
    };

    let reviews = items
        .into_iter()
        .enumerate()
        .map(|(i, body)| {
            let reviewed_at = review_date(&body)
                .ok_or_else(|| ParseError::Invalid(format!("review {i} has no usable date")))?;
            Ok(Review { reviewed_at, body })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    Ok(ReviewBatch::new(reviews))
}

fn review_date(body: &Value) -> Option<DateTime<Utc>> {
    if let Some(at) = body.get("reviewed_at").and_then(Value::as_str) {
        return DateTime::parse_from_rfc3339(at)
            .ok()
            .map(|at| at.with_timezone(&Utc));
    }
    body.get("review_date")
        .and_then(Value::as_str)
        .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_review_json() {
        let batch = parse_review_json(
            r#"[
                {"review_date": "2024-03-01", "review": "Excelente"},
                {"reviewed_at": "2024-03-05T10:00:00Z", "review": "Bien"}
            ]"#,
        )
        .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.oldest().unwrap().date_naive().to_string(), "2024-03-01");
        assert_eq!(batch.newest().unwrap().to_rfc3339(), "2024-03-05T10:00:00+00:00");
        assert_eq!(batch.reviews[0].body["review"], "Excelente");
    }

    #[test]
    fn test_parse_empty_array() {
        assert!(parse_review_json("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_missing_date() {
        let err = parse_review_json(r#"[{"review": "sin fecha"}]"#).unwrap_err();
        assert!(matches!(err, ParseError::Invalid(_)));
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(parse_review_json(r#"{"reviews": []}"#).is_err());
        assert!(parse_review_json("not json").is_err());
    }

    #[test]
    fn test_from_command_line() {
        let parser = CommandParser::from_command_line("python3 -m reviews.parse").unwrap();
        assert_eq!(parser.program, "python3");
        assert_eq!(parser.args, vec!["-m", "reviews.parse"]);
        assert!(CommandParser::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let parser = CommandParser::new("resenha-no-such-parser", Vec::new());
        let err = parser.parse("<html></html>").await.unwrap_err();
        assert!(matches!(err, ParseError::Command(_)));
    }
}

//! Command execution.

use crate::Commands;
use colored::Colorize;
use genlink_client::{Client, ClientError, InferenceOptions, JobResult, UploadAck};
use std::path::Path;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands, json: bool) -> Result<String, ClientError> {
    match cmd {
        Commands::Generate {
            prompt,
            reference,
            model,
            width,
            height,
            negative,
            steps,
            seed,
        } => {
            let mut options = InferenceOptions::default().with_size(width, height);
            if let Some(model) = model {
                options = options.with_model(model);
            }
            if let Some(negative) = negative {
                options = options.with_negative_prompt(negative);
            }
            if let Some(steps) = steps {
                options = options.with_steps(steps);
            }
            if let Some(seed) = seed {
                options = options.with_seed(seed);
            }

            let result = client
                .submit_inference_job(&prompt, reference.as_deref(), options)
                .await?;
            render_job(&result, json)
        }

        Commands::Upload { path } => {
            let bytes = std::fs::read(&path).map_err(|e| {
                ClientError::InvalidRequest(format!("cannot read {}: {}", path.display(), e))
            })?;
            let ack = client.upload_asset(&bytes, &file_name(&path)).await?;
            render_upload(&ack, &path, json)
        }

        Commands::Fetch { job_id } => {
            let result = client.fetch_job_result(&job_id).await?;
            render_job(&result, json)
        }

        Commands::Check => {
            client.connect().await?;
            Ok(format!(
                "{} to {}",
                "Connected".green(),
                client.connection().config().endpoint.cyan()
            ))
        }
    }
}

fn render_job(result: &JobResult, json: bool) -> Result<String, ClientError> {
    if json {
        return to_json(result);
    }

    let mut output = format!(
        "{} {}",
        "Image".green().bold(),
        result.image_reference().unwrap_or("(pending)").cyan()
    );
    if let Some(ref status) = result.status {
        output.push_str(&format!("\n  Status: {}", status.yellow()));
    }
    if let Some(ref uuid) = result.image_uuid {
        output.push_str(&format!("\n  Image UUID: {}", uuid));
    }
    if let Some(seed) = result.seed {
        output.push_str(&format!("\n  Seed: {}", seed));
    }
    if let Some(cost) = result.cost {
        output.push_str(&format!("\n  Cost: ${:.4}", cost));
    }
    if let Some(ms) = result.elapsed_ms {
        output.push_str(&format!("\n  Time: {}", format_elapsed(ms)));
    }
    output.push_str(&format!("\n  Task: {}", result.task_uuid.dimmed()));
    Ok(output)
}

fn render_upload(ack: &UploadAck, path: &Path, json: bool) -> Result<String, ClientError> {
    if json {
        return to_json(ack);
    }
    Ok(format!(
        "{} {} as {}",
        "Uploaded".green(),
        path.display(),
        ack.image_uuid.cyan()
    ))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ClientError> {
    serde_json::to_string_pretty(value).map_err(|e| ClientError::InvalidResponse(e.to_string()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Formats a duration in milliseconds for display.
fn format_elapsed(ms: u64) -> String {
    if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}ms", ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobResult {
        JobResult {
            task_uuid: "t-1".to_string(),
            image_uuid: Some("img-1".to_string()),
            image_url: Some("https://cdn.test/img-1.png".to_string()),
            status: None,
            cost: Some(0.0013),
            seed: Some(42),
            elapsed_ms: Some(2350),
        }
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(250), "250ms");
        assert_eq!(format_elapsed(2350), "2.4s");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name(Path::new("/tmp/ref.png")), "ref.png");
        assert_eq!(file_name(Path::new("ref.jpg")), "ref.jpg");
    }

    #[test]
    fn test_render_job_text() {
        colored::control::set_override(false);
        let output = render_job(&job(), false).unwrap();
        assert!(output.contains("https://cdn.test/img-1.png"));
        assert!(output.contains("Seed: 42"));
        assert!(output.contains("Cost: $0.0013"));
        assert!(output.contains("Time: 2.4s"));
        assert!(!output.contains("Status"));
    }

    #[test]
    fn test_render_job_json() {
        let output = render_job(&job(), true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["imageURL"], "https://cdn.test/img-1.png");
        assert_eq!(value["elapsedMs"], 2350);
    }

    #[test]
    fn test_render_upload() {
        colored::control::set_override(false);
        let ack = UploadAck {
            task_uuid: "t-2".to_string(),
            image_uuid: "upload-2".to_string(),
        };
        let output = render_upload(&ack, Path::new("ref.png"), false).unwrap();
        assert_eq!(output, "Uploaded ref.png as upload-2");
    }
}

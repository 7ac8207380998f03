use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, TimeZone};
use clap::{Parser, Subcommand};
use vigil_hw::Camera;

// `#[zbus::proxy]` generates `SurveillanceProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "org.vigil.Surveillance1",
    default_service = "org.vigil.Surveillance1",
    default_path = "/org/vigil/Surveillance1"
)]
trait Surveillance {
    async fn start_camera(&self) -> zbus::Result<()>;
    async fn stop_camera(&self) -> zbus::Result<bool>;
    async fn enroll(&self, name: &str, image_path: &str) -> zbus::Result<String>;
    async fn remove_identity(&self, name: &str) -> zbus::Result<u32>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn storage_usage(&self) -> zbus::Result<String>;
    async fn enforce_limits(&self) -> zbus::Result<String>;
    async fn export(&self, start: &str, end: &str) -> zbus::Result<Vec<String>>;
    async fn list_captures(&self) -> zbus::Result<String>;
    async fn delete_capture(&self, path: &str) -> zbus::Result<()>;
    async fn history(&self, limit: u32) -> zbus::Result<String>;
    async fn snapshot(&self, path: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil face surveillance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the camera and face processing
    Start,
    /// Stop the camera
    Stop,
    /// Enroll a known face
    Enroll {
        /// Identity name
        name: String,
        /// Reference image; the current camera frame is used when omitted
        #[arg(short, long)]
        image: Option<std::path::PathBuf>,
    },
    /// Remove an identity and its reference images
    Remove {
        name: String,
    },
    /// List enrolled identities
    List,
    /// Show daemon status
    Status,
    /// Show capture storage usage
    Usage,
    /// Apply the retention and size limits now
    Cleanup,
    /// Copy captures taken within a time range into an export directory
    Export {
        /// Range start (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        from: String,
        /// Range end (RFC 3339 or YYYY-MM-DD, inclusive)
        #[arg(long)]
        to: String,
    },
    /// List stored captures
    Captures,
    /// Delete one stored capture
    Delete {
        path: String,
    },
    /// Show recent detections
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Save the latest annotated frame
    Snapshot {
        /// Output image; the format follows the extension
        path: std::path::PathBuf,
    },
    /// List local V4L2 capture devices (does not need the daemon)
    Cameras,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Cameras = cli.command {
        let devices = Camera::list_devices();
        if devices.is_empty() {
            println!("No capture devices found");
        }
        for d in devices {
            println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
        }
        return Ok(());
    }

    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = SurveillanceProxy::new(&conn)
        .await
        .context("vigild is not reachable")?;

    match cli.command {
        Commands::Start => {
            proxy.start_camera().await?;
            println!("Camera started");
        }
        Commands::Stop => {
            if proxy.stop_camera().await? {
                println!("Camera stopped");
            } else {
                println!("Camera was not running");
            }
        }
        Commands::Enroll { name, image } => {
            let image_path = match image {
                Some(path) => std::fs::canonicalize(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?
                    .display()
                    .to_string(),
                None => String::new(),
            };
            let stored = proxy.enroll(&name, &image_path).await?;
            println!("Enrolled {name} ({stored})");
        }
        Commands::Remove { name } => {
            let removed = proxy.remove_identity(&name).await?;
            println!("Removed {name} ({removed} reference(s))");
        }
        Commands::List => print_json(&proxy.list_identities().await?)?,
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Usage => print_json(&proxy.storage_usage().await?)?,
        Commands::Cleanup => print_json(&proxy.enforce_limits().await?)?,
        Commands::Export { from, to } => {
            let start = parse_bound(&from, false)?;
            let end = parse_bound(&to, true)?;
            let exported = proxy.export(&start.to_rfc3339(), &end.to_rfc3339()).await?;
            if exported.is_empty() {
                println!("No captures in range");
            }
            for path in exported {
                println!("{path}");
            }
        }
        Commands::Captures => print_json(&proxy.list_captures().await?)?,
        Commands::Delete { path } => {
            proxy.delete_capture(&path).await?;
            println!("Deleted {path}");
        }
        Commands::History { limit } => print_json(&proxy.history(limit).await?)?,
        Commands::Snapshot { path } => {
            // The daemon resolves relative paths against its own cwd.
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()?.join(path)
            };
            proxy.snapshot(&path.display().to_string()).await?;
            println!("Saved {}", path.display());
        }
        Commands::Cameras => {}
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Parse an RFC 3339 timestamp, or a local date meaning the start (or, for
/// `end_of_day`, the last instant) of that day.
fn parse_bound(value: &str, end_of_day: bool) -> Result<DateTime<Local>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.with_timezone(&Local));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("{value:?} is neither RFC 3339 nor YYYY-MM-DD"))?;
    let time = if end_of_day {
        date.and_hms_nano_opt(23, 59, 59, 999_999_999)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
    .context("invalid time of day")?;
    Local
        .from_local_datetime(&time)
        .earliest()
        .with_context(|| format!("{value} does not exist in the local timezone"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_bound_date() {
        let start = parse_bound("2024-05-01", false).unwrap();
        let end = parse_bound("2024-05-01", true).unwrap();
        assert_eq!((start.hour(), start.minute()), (0, 0));
        assert_eq!((end.hour(), end.minute(), end.second()), (23, 59, 59));
        assert_eq!(end.nanosecond(), 999_999_999);
        let last_half_second =
            Local.with_ymd_and_hms(2024, 5, 1, 23, 59, 59).unwrap() + chrono::Duration::milliseconds(500);
        assert!(end > last_half_second);
        assert!(start < end);
    }

    #[test]
    fn test_parse_bound_rfc3339() {
        let t = parse_bound("2024-05-01T08:30:00Z", false).unwrap();
        assert_eq!(t.with_timezone(&chrono::Utc).hour(), 8);
    }

    #[test]
    fn test_parse_bound_rejects_garbage() {
        assert!(parse_bound("last week", false).is_err());
    }

    #[test]
    fn test_cli_parses_export() {
        let cli = Cli::try_parse_from(["vigil", "export", "--from", "2024-01-01", "--to", "2024-01-31"]).unwrap();
        assert!(matches!(cli.command, Commands::Export { .. }));
    }
}

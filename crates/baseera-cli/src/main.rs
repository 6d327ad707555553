use anyhow::{Context, Result};
use baseera_hw::Camera;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.baseera.Kiosk1",
    default_service = "org.baseera.Kiosk1",
    default_path = "/org/baseera/Kiosk1"
)]
trait Kiosk {
    async fn status(&self) -> zbus::Result<String>;
    async fn snapshot(&self) -> zbus::Result<Vec<u8>>;
    async fn today_attendance(&self) -> zbus::Result<String>;
    async fn absentees(&self) -> zbus::Result<String>;
    async fn list_employees(&self) -> zbus::Result<String>;
    async fn enroll(&self, name: &str, email: &str) -> zbus::Result<u32>;
    async fn remove_employee(&self, name: &str) -> zbus::Result<bool>;
    async fn update_email(&self, name: &str, email: &str) -> zbus::Result<bool>;
    async fn notify_absentees(&self) -> zbus::Result<u32>;
    async fn get_settings(&self) -> zbus::Result<String>;
    async fn set_setting(&self, key: &str, value: &str) -> zbus::Result<()>;
    async fn reload_settings(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "baseera", about = "Baseera attendance kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Show today's attendance
    Today,
    /// List employees who have not checked in today
    Absentees,
    /// List enrolled employees
    Employees,
    /// Enroll a new employee (the subject must face the camera)
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
    },
    /// Remove an employee, their attendance and face data
    Remove { name: String },
    /// Change an employee's email address
    SetEmail { name: String, email: String },
    /// Show kiosk settings
    Settings,
    /// Change a kiosk setting
    Set { key: String, value: String },
    /// Re-read kiosk settings from the database
    Reload,
    /// Email a reminder to every employee absent today
    NotifyAbsentees,
    /// Save the latest annotated frame as JPEG
    Snapshot {
        #[arg(short, long, default_value = "snapshot.jpg")]
        output: PathBuf,
    },
    /// Run camera diagnostics (daemon must not be holding the camera)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Save the first usable frame here
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

async fn connect(system: bool) -> Result<KioskProxy<'static>> {
    tracing::debug!(system, "connecting to baseerad");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    KioskProxy::new(&conn)
        .await
        .context("baseerad is not reachable; is it running?")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Test { device, save } => return camera_test(&device, save.as_deref()),
        command => command,
    };

    let kiosk = connect(cli.system).await?;
    match command {
        Commands::Status => {
            let status: Value = serde_json::from_str(&kiosk.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Today => {
            let records = json_array(&kiosk.today_attendance().await?)?;
            if records.is_empty() {
                println!("No attendance recorded today");
            }
            for record in records {
                println!("{:<24} {}", text(&record["employee"]), text(&record["recorded_at"]));
            }
        }
        Commands::Absentees => print_employees(&json_array(&kiosk.absentees().await?)?, "Everyone is in"),
        Commands::Employees => print_employees(&json_array(&kiosk.list_employees().await?)?, "No employees enrolled"),
        Commands::Enroll { name, email } => {
            println!("Enrolling {name}: look at the camera...");
            let models = kiosk.enroll(&name, &email).await?;
            println!("Enrolled {name} with {models} face model(s)");
        }
        Commands::Remove { name } => {
            if kiosk.remove_employee(&name).await? {
                println!("Removed {name}");
            } else {
                println!("No employee named {name}");
            }
        }
        Commands::SetEmail { name, email } => {
            if kiosk.update_email(&name, &email).await? {
                println!("Updated email for {name}");
            } else {
                println!("No employee named {name}");
            }
        }
        Commands::Settings => {
            let settings: Value = serde_json::from_str(&kiosk.get_settings().await?)?;
            if let Value::Object(map) = settings {
                for (key, value) in map {
                    println!("{key:<28} {}", text(&value));
                }
            }
        }
        Commands::Set { key, value } => {
            kiosk.set_setting(&key, &value).await?;
            println!("{key} = {value}");
        }
        Commands::Reload => {
            kiosk.reload_settings().await?;
            println!("Settings reloaded");
        }
        Commands::NotifyAbsentees => {
            let queued = kiosk.notify_absentees().await?;
            println!("Queued {queued} reminder(s)");
        }
        Commands::Snapshot { output } => {
            let jpeg = kiosk.snapshot().await?;
            std::fs::write(&output, &jpeg).with_context(|| format!("failed to write {}", output.display()))?;
            println!("Saved {} ({} bytes)", output.display(), jpeg.len());
        }
        Commands::Test { .. } => {}
    }

    Ok(())
}

fn json_array(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str(raw)? {
        Value::Array(items) => Ok(items),
        other => anyhow::bail!("unexpected reply from daemon: {other}"),
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_employees(employees: &[Value], empty: &str) {
    if employees.is_empty() {
        println!("{empty}");
    }
    for employee in employees {
        println!("{:<24} {}", text(&employee["name"]), text(&employee["email"]));
    }
}

fn camera_test(device: &str, save: Option<&std::path::Path>) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for info in &devices {
        println!("  {}: {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let camera = Camera::open(device, 640, 480).with_context(|| format!("cannot open {device}"))?;
    println!("Opened {device}: {}x{} {}", camera.width, camera.height, camera.fourcc);
    let mut session = camera.into_session()?;
    let (frames, dark) = session.capture_frames(5)?;
    println!("Captured {} usable frame(s), skipped {dark} dark", frames.len());

    for frame in &frames {
        println!(
            "  #{:<6} {}x{} brightness {:.1}",
            frame.sequence,
            frame.width(),
            frame.height(),
            frame.avg_brightness()
        );
    }

    if let (Some(path), Some(frame)) = (save, frames.first()) {
        frame
            .image
            .save(path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        println!("Saved {}", path.display());
    }

    Ok(())
}

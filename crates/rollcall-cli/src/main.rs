use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll(
        &self,
        roll_number: &str,
        name: &str,
        class_id: &str,
        image: &[u8],
    ) -> zbus::Result<String>;
    async fn submit_attendance(
        &self,
        class_id: &str,
        image: &[u8],
        timestamp: &str,
    ) -> zbus::Result<String>;
    async fn mark_manual(&self, student_id: &str, class_id: &str, date: &str)
        -> zbus::Result<String>;
    async fn remove_student(&self, student_id: &str) -> zbus::Result<bool>;
    async fn define_class(
        &self,
        class_id: &str,
        name: &str,
        days: &str,
        start: &str,
        end: &str,
    ) -> zbus::Result<()>;
    async fn delete_class(&self, class_id: &str) -> zbus::Result<bool>;
    async fn list_classes(&self) -> zbus::Result<String>;
    async fn list_students(&self, class_id: &str) -> zbus::Result<String>;
    async fn attendance_report(&self, class_id: &str, from: &str, to: &str)
        -> zbus::Result<String>;
    async fn daily_summary(&self, class_id: &str, date: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) a student from a single photo
    Enroll {
        #[arg(short, long)]
        roll: String,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        class: String,
        /// Photo with the student's face as the largest face
        image: PathBuf,
    },
    /// Submit a group photo for a class in session
    Attend {
        #[arg(short, long)]
        class: String,
        image: PathBuf,
        /// Local time of the photo, e.g. 2024-06-05T09:05 (default: now)
        #[arg(long, default_value = "")]
        at: String,
    },
    /// Manually mark a student present
    Mark {
        #[arg(short, long)]
        student: String,
        #[arg(short, long)]
        class: String,
        /// YYYY-MM-DD (default: today)
        #[arg(long, default_value = "")]
        date: String,
    },
    /// Remove a student and retrain their class
    Remove {
        /// Student ID to remove
        student: String,
    },
    /// Manage class schedules
    Class {
        #[command(subcommand)]
        command: ClassCommands,
    },
    /// Show the attendance summary of a class for one day
    Summary {
        #[arg(short, long)]
        class: String,
        #[arg(long, default_value = "")]
        date: String,
    },
    /// List enrolled students with their IDs
    Students {
        /// Only this class (default: every class)
        #[arg(short, long, default_value = "")]
        class: String,
    },
    /// List attendance records over a date range
    Report {
        /// Only this class (default: every class)
        #[arg(short, long, default_value = "")]
        class: String,
        /// YYYY-MM-DD (default: six days before --to)
        #[arg(long, default_value = "")]
        from: String,
        /// YYYY-MM-DD (default: today)
        #[arg(long, default_value = "")]
        to: String,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum ClassCommands {
    /// Create or replace a class
    Define {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// Weekdays, e.g. "Mon,Wed,Fri"
        #[arg(long)]
        days: String,
        /// HH:MM
        #[arg(long)]
        start: String,
        /// HH:MM
        #[arg(long)]
        end: String,
    },
    /// Define every `[[class]]` table of a TOML file
    Import { file: PathBuf },
    /// List classes and whether they are in session
    List,
    /// Delete a class with no enrolled students
    Delete { id: String },
}

/// One `[[class]]` entry of an import file.
#[derive(Debug, Deserialize, PartialEq)]
struct ClassEntry {
    id: String,
    name: String,
    days: Vec<String>,
    start: String,
    end: String,
}

#[derive(Debug, Deserialize)]
struct ClassFile {
    #[serde(default)]
    class: Vec<ClassEntry>,
}

fn parse_class_file(contents: &str) -> Result<Vec<ClassEntry>> {
    let file: ClassFile = toml::from_str(contents).context("parsing class file")?;
    Ok(file.class)
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(json: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_outcome(json: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let verdicts = value["verdicts"].as_array().cloned().unwrap_or_default();
    if verdicts.is_empty() {
        println!("No enrolled faces recognised.");
    }
    for v in &verdicts {
        println!(
            "{:<38} {:>6.1}%  {}",
            v["student_id"].as_str().unwrap_or("?"),
            v["confidence"].as_f64().unwrap_or(0.0),
            v["status"].as_str().unwrap_or("?"),
        );
    }
    let committed = value["committed"].as_array().map_or(0, Vec::len);
    let already = value["already_recorded"].as_array().map_or(0, Vec::len);
    println!("{committed} recorded, {already} already present today");
    Ok(())
}

fn print_students(json: &str) -> Result<()> {
    let students: Vec<serde_json::Value> = serde_json::from_str(json)?;
    if students.is_empty() {
        println!("No students enrolled.");
    }
    for s in &students {
        println!(
            "{:<10} {:<24} {:<12} {}",
            s["roll_number"].as_str().unwrap_or("?"),
            s["name"].as_str().unwrap_or("?"),
            s["class_id"].as_str().unwrap_or("?"),
            s["id"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

fn print_report(json: &str) -> Result<()> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(json)?;
    for e in &entries {
        let status = match (e["method"].as_str(), e["punctuality"].as_str()) {
            (Some("manual"), _) => "manual",
            (_, Some("late")) => "late",
            _ => "on time",
        };
        println!(
            "{}  {:<12} {:<10} {:<24} {}",
            e["date"].as_str().unwrap_or("?"),
            e["class_id"].as_str().unwrap_or("?"),
            e["roll_number"].as_str().unwrap_or("-"),
            e["name"].as_str().unwrap_or("(removed)"),
            status,
        );
    }
    println!("{} records", entries.len());
    Ok(())
}

async fn connect() -> Result<zbus::Connection> {
    let builder = if std::env::var("ROLLCALL_SYSTEM_BUS").is_ok() {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    // Enrollment augments and retrains inside the call.
    builder
        .method_timeout(Duration::from_secs(120))
        .build()
        .await
        .context("connecting to D-Bus (is rollcalld running?)")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let conn = connect().await?;
    let proxy = AttendanceProxy::new(&conn).await?;

    match cli.command {
        Commands::Enroll {
            roll,
            name,
            class,
            image,
        } => {
            let bytes = read_image(&image)?;
            tracing::debug!(bytes = bytes.len(), "sending enrollment photo");
            print_json(&proxy.enroll(&roll, &name, &class, &bytes).await?)?;
        }
        Commands::Attend { class, image, at } => {
            let bytes = read_image(&image)?;
            print_outcome(&proxy.submit_attendance(&class, &bytes, &at).await?)?;
        }
        Commands::Mark {
            student,
            class,
            date,
        } => {
            print_json(&proxy.mark_manual(&student, &class, &date).await?)?;
        }
        Commands::Remove { student } => {
            if proxy.remove_student(&student).await? {
                println!("Removed {student}");
            } else {
                println!("No student with id {student}");
            }
        }
        Commands::Class { command } => match command {
            ClassCommands::Define {
                id,
                name,
                days,
                start,
                end,
            } => {
                proxy.define_class(&id, &name, &days, &start, &end).await?;
                println!("Defined class {id}");
            }
            ClassCommands::Import { file } => {
                let contents = std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?;
                let entries = parse_class_file(&contents)?;
                for c in &entries {
                    proxy
                        .define_class(&c.id, &c.name, &c.days.join(","), &c.start, &c.end)
                        .await
                        .with_context(|| format!("defining class {}", c.id))?;
                    println!("Defined class {}", c.id);
                }
                println!("{} classes imported", entries.len());
            }
            ClassCommands::List => print_json(&proxy.list_classes().await?)?,
            ClassCommands::Delete { id } => {
                if proxy.delete_class(&id).await? {
                    println!("Deleted class {id}");
                } else {
                    println!("No class with id {id}");
                }
            }
        },
        Commands::Summary { class, date } => {
            print_json(&proxy.daily_summary(&class, &date).await?)?;
        }
        Commands::Students { class } => print_students(&proxy.list_students(&class).await?)?,
        Commands::Report { class, from, to } => {
            print_report(&proxy.attendance_report(&class, &from, &to).await?)?;
        }
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_report_and_students_arguments() {
        let cli = Cli::try_parse_from(["rollcall", "report", "--class", "math", "--from", "2024-06-01"]).unwrap();
        match cli.command {
            Commands::Report { class, from, to } => {
                assert_eq!(class, "math");
                assert_eq!(from, "2024-06-01");
                assert!(to.is_empty());
            }
            _ => panic!("expected report"),
        }
        let cli = Cli::try_parse_from(["rollcall", "students"]).unwrap();
        assert!(matches!(cli.command, Commands::Students { class } if class.is_empty()));
        let cli = Cli::try_parse_from(["rollcall", "class", "delete", "math"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Class { command: ClassCommands::Delete { id } } if id == "math"
        ));
    }

    #[test]
    fn test_parse_class_file() {
        let entries = parse_class_file(
            r#"
            [[class]]
            id = "cs101"
            name = "Intro to Programming"
            days = ["Mon", "Wed", "Fri"]
            start = "09:00"
            end = "10:00"

            [[class]]
            id = "art"
            name = "Art"
            days = ["Sat"]
            start = "13:30"
            end = "15:00"
            "#,
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].days.join(","), "Mon,Wed,Fri");
        assert_eq!(entries[1].start, "13:30");
    }

    #[test]
    fn test_parse_class_file_empty_and_invalid() {
        assert!(parse_class_file("").unwrap().is_empty());
        assert!(parse_class_file("[[class]]\nid = 1").is_err());
    }
}

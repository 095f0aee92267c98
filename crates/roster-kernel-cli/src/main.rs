use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use roster_kernel_api::{
    AttendanceRequest, CreateStudentRequest, ImportOptions, PollRequest, Registry,
    API_CONTRACT_VERSION,
};
use roster_kernel_core::{ChannelMessage, PlatformIdentity, RosterId, StudentNumber};
use roster_kernel_store_file::FileRosterStore;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Roster Kernel CLI")]
struct Cli {
    #[arg(long, env = "ROSTER_DATA_DIR", default_value = "./roster-data")]
    data_dir: PathBuf,

    #[arg(long, env = "ROSTER_ID")]
    roster_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Student {
        #[command(subcommand)]
        command: StudentCommand,
    },
    Roster {
        #[command(subcommand)]
        command: RosterCommand,
    },
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
}

#[derive(Debug, Subcommand)]
enum StudentCommand {
    Create(CreateArgs),
    Remove(NumberArgs),
    Reset(NumberArgs),
    RotateSecret(NumberArgs),
    Register(RegisterArgs),
    Show(ShowArgs),
    List,
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    number: u64,
    #[arg(long, default_value = "")]
    email: String,
    #[arg(long, default_value_t = false)]
    overwrite: bool,
    /// Also write the student's record file (CSV) to this path.
    #[arg(long)]
    record_out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct NumberArgs {
    #[arg(long)]
    number: u64,
}

#[derive(Debug, Args)]
struct RegisterArgs {
    #[arg(long)]
    secret: String,
    #[arg(long)]
    identity_name: String,
    #[arg(long)]
    identity_id: u64,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("key").required(true).args(["number", "identity_id"])))]
struct ShowArgs {
    #[arg(long)]
    number: Option<u64>,
    #[arg(long)]
    identity_id: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum RosterCommand {
    Export(ExportArgs),
    Import(ImportArgs),
    Status,
    Save,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Write the CSV here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    has_header: bool,
    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    /// Words typed per student, from a JSON array of `{author_id, content}`.
    Words(ReportArgs),
    /// Poll results, from a JSON `{options, reactions, bot_id}` document.
    Poll(ReportArgs),
    /// Attendance, from a JSON `{responders, bot_id}` document.
    Attendance(ReportArgs),
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let roster_id = RosterId::parse(&cli.roster_id)?;
    let registry = Registry::create_or_load(FileRosterStore::new(&cli.data_dir), roster_id)?;
    match cli.command {
        Command::Student { command } => run_student(command, &registry),
        Command::Roster { command } => run_roster(command, &registry),
        Command::Report { command } => run_report(command, &registry),
    }
}

fn run_student(command: StudentCommand, registry: &Registry) -> Result<()> {
    match command {
        StudentCommand::Create(args) => run_student_create(args, registry),
        StudentCommand::Remove(args) => {
            let view = registry.remove(StudentNumber(args.number))?;
            let report = registry.save()?;
            emit_json(serde_json::json!({ "removed": view, "saved": report }))
        }
        StudentCommand::Reset(args) => {
            let view = registry.reset(StudentNumber(args.number))?;
            let report = registry.save()?;
            emit_json(serde_json::json!({ "student": view, "saved": report }))
        }
        StudentCommand::RotateSecret(args) => {
            let view = registry.regenerate_secret(StudentNumber(args.number))?;
            let report = registry.save()?;
            emit_json(serde_json::json!({ "student": view, "saved": report }))
        }
        StudentCommand::Register(args) => {
            let identity = PlatformIdentity { name: args.identity_name, id: args.identity_id };
            let view = registry.register(&args.secret, identity)?;
            let report = registry.save()?;
            emit_json(serde_json::json!({ "student": view, "saved": report }))
        }
        StudentCommand::Show(args) => {
            let view = match (args.number, args.identity_id) {
                (Some(number), _) => registry.lookup_by_number(StudentNumber(number))?,
                (None, Some(identity_id)) => registry.lookup_by_identity(identity_id)?,
                (None, None) => anyhow::bail!("either --number or --identity-id is required"),
            };
            emit_json(serde_json::json!({ "student": view }))
        }
        StudentCommand::List => {
            let students = registry.list();
            emit_json(serde_json::json!({ "count": students.len(), "students": students }))
        }
    }
}

fn run_student_create(args: CreateArgs, registry: &Registry) -> Result<()> {
    let view = registry.create(CreateStudentRequest {
        name: args.name,
        number: StudentNumber(args.number),
        email: args.email,
        overwrite: args.overwrite,
    })?;
    let report = registry.save()?;

    let record_file = match args.record_out {
        Some(path) => {
            let csv = registry.export_student_csv(view.number)?;
            write_output(&path, &csv)?;
            Some(path.display().to_string())
        }
        None => None,
    };
    emit_json(serde_json::json!({
        "student": view,
        "record_file": record_file,
        "saved": report
    }))
}

fn run_roster(command: RosterCommand, registry: &Registry) -> Result<()> {
    match command {
        RosterCommand::Export(args) => {
            let csv = registry.export_csv()?;
            match args.out {
                Some(path) => {
                    write_output(&path, &csv)?;
                    emit_json(serde_json::json!({
                        "out": path.display().to_string(),
                        "students": registry.status().students
                    }))
                }
                None => {
                    print!("{csv}");
                    Ok(())
                }
            }
        }
        RosterCommand::Import(args) => {
            let input = fs::read(&args.input)
                .with_context(|| format!("failed to read {}", args.input.display()))?;
            let summary = registry.import_csv(
                &input,
                ImportOptions { has_header: args.has_header, overwrite: args.overwrite },
            );
            let report = registry.save()?;
            emit_json(serde_json::json!({ "import": summary, "saved": report }))
        }
        RosterCommand::Status => emit_json(serde_json::to_value(registry.status())?),
        RosterCommand::Save => emit_json(serde_json::to_value(registry.save()?)?),
    }
}

fn run_report(command: ReportCommand, registry: &Registry) -> Result<()> {
    match command {
        ReportCommand::Words(args) => {
            let messages: Vec<ChannelMessage> = read_json(&args.input)?;
            let lines = registry.word_participation(&messages);
            emit_json(serde_json::json!({ "participation": lines }))
        }
        ReportCommand::Poll(args) => {
            let request: PollRequest = read_json(&args.input)?;
            let summary = registry.summarize_poll(&request);
            emit_json(serde_json::json!({ "headline": summary.headline(), "poll": summary }))
        }
        ReportCommand::Attendance(args) => {
            let request: AttendanceRequest = read_json(&args.input)?;
            let present = registry.attendance(&request);
            emit_json(serde_json::json!({ "count": present.len(), "present": present }))
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_output(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use groupsync_api::GroupSyncApi;
use groupsync_core::{
    CommunityGroupId, CommunityMemberId, ContactId, Direction, DirectoryGroupId, MemberAction,
    MembershipChange, Role, SyncConfig, SyncEvent,
};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "gsync")]
#[command(about = "Community and Directory group sync CLI")]
struct Cli {
    #[arg(long, default_value = "./groupsync.sqlite3")]
    db: PathBuf,

    /// YAML file overriding the default sync configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Fixture {
        #[command(subcommand)]
        command: FixtureCommand,
    },
    Batch {
        #[command(subcommand)]
        command: BatchCommand,
    },
    Sync {
        #[command(subcommand)]
        command: Box<SyncCommand>,
    },
    Inspect {
        #[command(subcommand)]
        command: InspectCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum FixtureCommand {
    Load(FixtureLoadArgs),
}

#[derive(Debug, Args)]
struct FixtureLoadArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum BatchCommand {
    /// Process one page of a resumable batch.
    Step(BatchStepArgs),
    /// Process every page in one call without persisting a cursor.
    Run(BatchRunArgs),
    Status(BatchIdArgs),
    Cancel(BatchIdArgs),
}

#[derive(Debug, Args)]
struct BatchStepArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_enum)]
    direction: DirectionArg,
    #[arg(long)]
    page_size: Option<u64>,
}

#[derive(Debug, Args)]
struct BatchRunArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_enum)]
    direction: DirectionArg,
}

#[derive(Debug, Args)]
struct BatchIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    Group(GroupArgs),
    DeleteGroup(GroupArgs),
    Member(MemberArgs),
    Promote(MemberRefArgs),
    Demote(MemberRefArgs),
    Contact(ContactArgs),
    Hierarchy(HierarchyArgs),
    /// Apply one JSON change notification.
    Event(EventArgs),
}

#[derive(Debug, Args)]
struct GroupArgs {
    #[arg(long)]
    group: u64,
}

#[derive(Debug, Args)]
struct MemberArgs {
    #[arg(long)]
    group: u64,
    #[arg(long)]
    member: u64,
    #[arg(long, value_enum)]
    action: ActionArg,
    #[arg(long, value_enum, default_value = "member")]
    role: RoleArg,
    #[arg(long, value_enum)]
    previous_role: Option<RoleArg>,
}

#[derive(Debug, Args)]
struct MemberRefArgs {
    #[arg(long)]
    group: u64,
    #[arg(long)]
    member: u64,
}

#[derive(Debug, Args)]
struct ContactArgs {
    #[arg(long)]
    directory_group: u64,
    #[arg(long)]
    contact: u64,
    #[arg(long, value_enum)]
    action: ActionArg,
}

#[derive(Debug, Args)]
struct HierarchyArgs {
    #[arg(long)]
    group: u64,
    #[arg(long)]
    parent: Option<u64>,
}

#[derive(Debug, Args)]
struct EventArgs {
    #[arg(long)]
    json: String,
}

#[derive(Debug, Subcommand)]
enum InspectCommand {
    Pair(GroupArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    CommunityToDirectory,
    DirectoryToCommunity,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Member,
    Admin,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ActionArg {
    Add,
    Remove,
}

impl From<DirectionArg> for Direction {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::CommunityToDirectory => Self::CommunityToDirectory,
            DirectionArg::DirectoryToCommunity => Self::DirectoryToCommunity,
        }
    }
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Member => Self::Member,
            RoleArg::Admin => Self::Admin,
        }
    }
}

impl From<ActionArg> for MemberAction {
    fn from(value: ActionArg) -> Self {
        match value {
            ActionArg::Add => Self::Add,
            ActionArg::Remove => Self::Remove,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value)?)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    SyncConfig::from_yaml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_ref())?;
    let api = GroupSyncApi::new(cli.db, config);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Fixture { command } => run_fixture(command, &api),
        Command::Batch { command } => run_batch(command, &api),
        Command::Sync { command } => run_sync(*command, &api),
        Command::Inspect { command } => run_inspect(command, &api),
    }
}

fn run_db(command: DbCommand, api: &GroupSyncApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
    }
}

fn run_fixture(command: FixtureCommand, api: &GroupSyncApi) -> Result<()> {
    match command {
        FixtureCommand::Load(args) => emit(&api.load_fixture(&args.input)?),
    }
}

fn run_batch(command: BatchCommand, api: &GroupSyncApi) -> Result<()> {
    match command {
        BatchCommand::Step(args) => {
            emit(&api.batch_step(&args.id, args.direction.into(), args.page_size)?)
        }
        BatchCommand::Run(args) => emit(&api.batch_run(&args.id, args.direction.into())?),
        BatchCommand::Status(args) => emit(&api.batch_status(&args.id)?),
        BatchCommand::Cancel(args) => emit(&api.batch_cancel(&args.id)?),
    }
}

fn run_sync(command: SyncCommand, api: &GroupSyncApi) -> Result<()> {
    match command {
        SyncCommand::Group(args) => emit(&api.sync_group(CommunityGroupId(args.group))?),
        SyncCommand::DeleteGroup(args) => emit(&api.delete_group(CommunityGroupId(args.group))?),
        SyncCommand::Member(args) => {
            let role = Role::from(args.role);
            let change = match args.action {
                ActionArg::Add => MembershipChange {
                    action: MemberAction::Add,
                    role,
                    previous_role: args.previous_role.map(Role::from),
                },
                ActionArg::Remove => {
                    if args.previous_role.is_some() {
                        bail!("--previous-role only applies to --action add");
                    }
                    MembershipChange::remove(role)
                }
            };
            emit(&api.sync_member(
                CommunityGroupId(args.group),
                CommunityMemberId(args.member),
                change,
            )?)
        }
        SyncCommand::Promote(args) => emit(&api.sync_member(
            CommunityGroupId(args.group),
            CommunityMemberId(args.member),
            MembershipChange::promote(),
        )?),
        SyncCommand::Demote(args) => emit(&api.sync_member(
            CommunityGroupId(args.group),
            CommunityMemberId(args.member),
            MembershipChange::demote(),
        )?),
        SyncCommand::Contact(args) => emit(&api.sync_contact(
            DirectoryGroupId(args.directory_group),
            ContactId(args.contact),
            args.action.into(),
        )?),
        SyncCommand::Hierarchy(args) => emit(&api.sync_hierarchy(
            CommunityGroupId(args.group),
            args.parent.map(CommunityGroupId),
        )?),
        SyncCommand::Event(args) => {
            let event: SyncEvent =
                serde_json::from_str(&args.json).context("failed to parse event JSON")?;
            emit(&api.apply_event(event)?)
        }
    }
}

fn run_inspect(command: InspectCommand, api: &GroupSyncApi) -> Result<()> {
    match command {
        InspectCommand::Pair(args) => {
            let group = CommunityGroupId(args.group);
            let report = api
                .inspect_pair(group)?
                .ok_or_else(|| anyhow!("community group {group} has no mirror pair"))?;
            emit(&report)
        }
    }
}

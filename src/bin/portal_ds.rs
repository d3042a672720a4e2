use std::fs;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use portal_dataset::api::PortalHttpClient;
use portal_dataset::app::App;
use portal_dataset::catalog::CatalogIndex;
use portal_dataset::config::{ConfigLoader, ResolvedConfig};
use portal_dataset::dataset::{ProjectSelection, SingleCellSelection};
use portal_dataset::domain::{ComputedFileDescriptor, DatasetId, Format, Modality, ProjectId, SampleId};
use portal_dataset::error::PortalError;
use portal_dataset::lifecycle::CancelToken;
use portal_dataset::local_state::{FileKvStore, LocalState};
use portal_dataset::output::{JsonOutput, OutputMode, progress_sink};
use portal_dataset::resolver::{DownloadChoice, DownloadOptions, OptionsResolver};
use portal_dataset::store::{FormatChange, MergeStrategy};

#[derive(Parser)]
#[command(name = "portal-ds")]
#[command(about = "Compose portal datasets and resolve downloadable files")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show download options and the file they resolve to")]
    Options(OptionsArgs),
    #[command(about = "Manage My Dataset")]
    Dataset(DatasetArgs),
}

#[derive(Args)]
struct OptionsArgs {
    #[arg(long, help = "Computed files JSON; fetched from the portal when omitted")]
    catalog: Option<String>,

    #[arg(long)]
    project: Option<ProjectId>,

    #[arg(long)]
    modality: Option<Modality>,

    #[arg(long)]
    format: Option<Format>,

    #[arg(long)]
    merged: Option<bool>,

    #[arg(long)]
    exclude_multiplexed: Option<bool>,

    #[arg(long, help = "Fetch a signed download link for the resolved file")]
    link: bool,
}

#[derive(Args)]
struct DatasetArgs {
    #[command(subcommand)]
    command: DatasetCommand,
}

#[derive(Subcommand)]
enum DatasetCommand {
    #[command(about = "Print My Dataset")]
    Show,
    #[command(about = "Print sample counts for My Dataset")]
    Summary,
    #[command(about = "Add samples from a project")]
    Add(AddArgs),
    #[command(about = "Remove a project")]
    Remove { project: ProjectId },
    #[command(about = "Remove every project")]
    Clear,
    #[command(about = "Change the packaging format")]
    Format {
        format: Format,
        #[arg(long, help = "Drop samples the new format cannot package")]
        yes: bool,
    },
    #[command(about = "Merge a shared dataset into My Dataset")]
    Merge {
        id: DatasetId,
        #[arg(long, value_enum, default_value_t = MergeStrategy::Append)]
        strategy: MergeStrategy,
    },
    #[command(about = "Submit My Dataset for packaging and wait for it")]
    Process {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        accept_terms: bool,
    },
    #[command(about = "Show a dataset's processing state")]
    Status { id: DatasetId },
    #[command(about = "Print the download link of a ready dataset")]
    Download { id: DatasetId },
    #[command(about = "Start a new dataset from an expired one")]
    Regenerate { id: DatasetId },
}

#[derive(Args)]
struct AddArgs {
    project: ProjectId,

    #[arg(long, num_args = 1.., value_delimiter = ',')]
    single_cell: Vec<SampleId>,

    #[arg(long, num_args = 1.., value_delimiter = ',')]
    spatial: Vec<SampleId>,

    #[arg(long, conflicts_with = "single_cell")]
    merged: bool,

    #[arg(long)]
    bulk: bool,
}

#[derive(Serialize)]
struct OptionsReport<'a> {
    options: &'a DownloadOptions,
    choice: DownloadChoice,
    file: Option<&'a ComputedFileDescriptor>,
    error: Option<String>,
    download_url: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PortalError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PortalError) -> u8 {
    match error {
        PortalError::NoMatchingFile(_)
        | PortalError::MergeConflict { .. }
        | PortalError::DatasetNotReady(_)
        | PortalError::NotExpired(_) => 2,
        PortalError::RemoteRequestFailed { .. }
        | PortalError::RemoteHttp(_)
        | PortalError::PollingExhausted(_) => 3,
        PortalError::AmbiguousCatalogEntry { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Options(args) => run_options(args, &config),
        Commands::Dataset(args) => run_dataset(args.command, &config, output_mode),
    }
}

fn build_app(config: &ResolvedConfig) -> Result<App<PortalHttpClient, FileKvStore>, PortalError> {
    let client = PortalHttpClient::new(config)?;
    let kv = match &config.state_dir {
        Some(dir) => FileKvStore::new_with_root(dir.clone()),
        None => FileKvStore::new()?,
    };
    let state = LocalState::hydrate(kv)?;
    Ok(App::new(
        client,
        state,
        config.poll_policy(),
        config.api_token.clone(),
    ))
}

fn run_options(args: OptionsArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let app = build_app(config)?;
    let mut resolver = match (&args.catalog, &args.project) {
        (Some(path), _) => {
            let content = fs::read_to_string(path)
                .map_err(|err| PortalError::CatalogRead(format!("{path}: {err}")))?;
            let files: Vec<ComputedFileDescriptor> = serde_json::from_str(&content)
                .map_err(|err| PortalError::CatalogRead(format!("{path}: {err}")))?;
            let snapshot = app.state().snapshot();
            OptionsResolver::with_preference(
                CatalogIndex::new(files),
                snapshot.user_modality,
                snapshot.user_format,
            )
        }
        (None, Some(project)) => app.download_options(project)?,
        (None, None) => {
            return Err(miette::Report::msg("either --catalog or --project is required"));
        }
    };

    if let Some(modality) = args.modality {
        resolver.set_modality(modality)?;
    }
    if let Some(format) = args.format {
        resolver.set_format(format)?;
    }
    if let Some(merged) = args.merged {
        if !resolver.set_includes_merged(merged) {
            eprintln!("merged option is not available for this choice");
        }
    }
    if let Some(exclude) = args.exclude_multiplexed {
        if !resolver.set_excludes_multiplexed(exclude) {
            eprintln!("multiplexed option is not available for this choice");
        }
    }

    let (file, error) = match resolver.resolve() {
        Ok(file) => (Some(file), None),
        Err(err @ PortalError::AmbiguousCatalogEntry { .. }) => return Err(err.into()),
        Err(err) => (None, Some(err.to_string())),
    };
    let download_url = match (file, args.link) {
        (Some(_), true) => {
            let (snapshot, download) = app.request_download(&resolver)?;
            Some(resolver.accept(&snapshot, download)?.download_url)
        }
        _ => None,
    };
    JsonOutput::print(&OptionsReport {
        options: resolver.options(),
        choice: resolver.choice(),
        file,
        error,
        download_url,
    })
    .into_diagnostic()?;
    Ok(())
}

fn run_dataset(
    command: DatasetCommand,
    config: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let mut app = build_app(config)?;
    let sink = progress_sink(output_mode);
    match command {
        DatasetCommand::Show => {
            let dataset = app.my_dataset();
            let classification = app.classify(&dataset);
            JsonOutput::print(&serde_json::json!({
                "dataset": dataset,
                "classification": classification,
            }))
            .into_diagnostic()?;
        }
        DatasetCommand::Summary => {
            JsonOutput::print(&app.summary()?).into_diagnostic()?;
        }
        DatasetCommand::Add(args) => {
            let single_cell = if args.merged {
                SingleCellSelection::Merged
            } else {
                SingleCellSelection::Samples(args.single_cell.into_iter().collect())
            };
            let selection = ProjectSelection {
                single_cell,
                spatial: args.spatial.into_iter().collect(),
                includes_bulk: args.bulk,
            };
            let dataset = app.add_to_my_dataset(args.project, &selection)?;
            JsonOutput::print(&dataset).into_diagnostic()?;
        }
        DatasetCommand::Remove { project } => {
            JsonOutput::print(&app.remove_from_my_dataset(&project)?).into_diagnostic()?;
        }
        DatasetCommand::Clear => {
            JsonOutput::print(&app.clear_my_dataset()?).into_diagnostic()?;
        }
        DatasetCommand::Format { format, yes } => match app.request_format_change(format)? {
            FormatChange::Applied => {
                JsonOutput::print(&app.my_dataset()).into_diagnostic()?;
            }
            FormatChange::NeedsConfirmation(pending) if yes => {
                JsonOutput::print(&app.confirm_format_change(&pending)?).into_diagnostic()?;
            }
            FormatChange::NeedsConfirmation(pending) => {
                JsonOutput::print(&pending).into_diagnostic()?;
                return Err(miette::Report::msg(
                    "format change drops samples; re-run with --yes to confirm",
                ));
            }
        },
        DatasetCommand::Merge { id, strategy } => {
            let dataset = app.merge_shared_dataset(&id, strategy, sink)?;
            JsonOutput::print(&dataset).into_diagnostic()?;
        }
        DatasetCommand::Process {
            email,
            accept_terms,
        } => {
            if let Some(email) = email {
                app.state_mut().set_email(Some(email))?;
            }
            if accept_terms {
                app.state_mut().set_terms_accepted(true)?;
            }
            let dataset = app.process_dataset(sink, CancelToken::new())?;
            let classification = app.classify(&dataset);
            JsonOutput::print(&serde_json::json!({
                "dataset": dataset,
                "classification": classification,
            }))
            .into_diagnostic()?;
        }
        DatasetCommand::Status { id } => {
            JsonOutput::print(&app.status(&id)?).into_diagnostic()?;
        }
        DatasetCommand::Download { id } => {
            println!("{}", app.dataset_download_url(&id)?);
        }
        DatasetCommand::Regenerate { id } => {
            JsonOutput::print(&app.regenerate(&id)?).into_diagnostic()?;
        }
    }
    Ok(())
}

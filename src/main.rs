pub(crate) mod config;
pub(crate) mod dimse;
pub(crate) mod encoder;
pub(crate) mod transfer;
pub(crate) mod types;
pub(crate) mod uid;

use crate::config::AppConfig;
use crate::dimse::association::client::UpperLayerConnector;
use crate::transfer::{BatchReport, ObjectStatus, Phase, Progress, TransferOrchestrator};
use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The implementation class UID for dicom-courier.
/// The UID is a randomly generated UUID represented as a single integer value under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.183645925708104752364917430266812405731";

/// The implementation version name for dicom-courier.
/// It consists of the string "COURIER" followed by the crate version, at most 16 characters.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("COURIER ", env!("CARGO_PKG_VERSION"));

/// Image file extensions picked up when a folder is given.
const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

/// Converts images to DICOM Secondary Capture objects and stores them in a PACS.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
	/// Configuration file to use instead of ./config.toml
	#[arg(short, long, value_name = "FILE")]
	config: Option<PathBuf>,

	/// Patient name written into every object. Defaults to the name of the input folder.
	#[arg(short, long, value_name = "NAME")]
	patient: Option<String>,

	/// Print the batch report as JSON.
	#[arg(long)]
	json: bool,

	/// Image files or folders containing images.
	#[arg(required = true, value_name = "INPUT")]
	inputs: Vec<PathBuf>,
}

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false)
				// stdout is reserved for the report
				.with_writer(std::io::stderr),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	}

	guard
}

fn main() -> anyhow::Result<ExitCode> {
	let cli = Cli::parse();
	let config = AppConfig::new(cli.config.as_deref()).context("Failed to load configuration")?;
	init_logger(config.telemetry.level);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	let report = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(cli, config));

	match report {
		Ok(report) if report.is_complete() => Ok(ExitCode::SUCCESS),
		Ok(_) => Ok(ExitCode::FAILURE),
		Err(error) => {
			error!("{error:#}");
			Ok(ExitCode::FAILURE)
		}
	}
}

async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<BatchReport> {
	let inputs = collect_inputs(&cli.inputs)?;
	let patient_name = match cli.patient {
		Some(name) => name,
		None => default_patient_name(&cli.inputs)?,
	};
	let settings = config.transfer_settings()?;
	info!(
		inputs = inputs.len(),
		patient_name,
		output = %settings.output_dir.display(),
		"Starting batch"
	);

	let cancel = CancellationToken::new();
	tokio::spawn({
		let cancel = cancel.clone();
		async move {
			if signal::ctrl_c().await.is_ok() {
				warn!("Interrupted, abandoning the remaining objects");
				cancel.cancel();
			}
		}
	});

	let orchestrator = TransferOrchestrator::new(UpperLayerConnector, settings);
	let report = orchestrator
		.run(&inputs, &patient_name, log_progress, &cancel)
		.await;

	if cli.json {
		println!("{}", serde_json::to_string_pretty(&report)?);
	} else {
		print_summary(&report);
	}
	Ok(report)
}

fn log_progress(progress: Progress) {
	let Progress { phase, done, total } = progress;
	match phase {
		Phase::Encoding => debug!(done, total, "Encoded"),
		Phase::Transferring => info!(done, total, "Transferred"),
	}
}

/// Expands folders into the image files they contain, sorted by name. Files are kept as given.
fn collect_inputs(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
	let mut inputs = Vec::new();
	for path in paths {
		if !path.is_dir() {
			inputs.push(path.clone());
			continue;
		}

		let mut images = Vec::new();
		for entry in std::fs::read_dir(path)
			.with_context(|| format!("Failed to read folder {}", path.display()))?
		{
			let entry = entry?.path();
			if entry.is_file() && is_image(&entry) {
				images.push(entry);
			}
		}
		images.sort();
		if images.is_empty() {
			warn!(folder = %path.display(), "Folder contains no images");
		}
		inputs.extend(images);
	}
	Ok(inputs)
}

fn is_image(path: &Path) -> bool {
	path.extension()
		.and_then(|extension| extension.to_str())
		.is_some_and(|extension| {
			IMAGE_EXTENSIONS
				.iter()
				.any(|known| known.eq_ignore_ascii_case(extension))
		})
}

/// The name of the single input folder, or of the folder containing the input files.
fn default_patient_name(paths: &[PathBuf]) -> anyhow::Result<String> {
	let folders: Vec<&Path> = paths
		.iter()
		.filter_map(|path| {
			if path.is_dir() {
				Some(path.as_path())
			} else {
				// A bare file name lives in the working directory.
				path.parent().map(|parent| {
					if parent.as_os_str().is_empty() {
						Path::new(".")
					} else {
						parent
					}
				})
			}
		})
		.collect();

	let name = match folders.as_slice() {
		[first, rest @ ..] if rest.iter().all(|folder| folder == first) => first
			.canonicalize()
			.ok()
			.and_then(|folder| folder.file_name().map(|name| name.to_string_lossy().into_owned())),
		_ => None,
	};
	match name {
		Some(name) if !name.trim().is_empty() => Ok(name),
		_ => bail!("Cannot derive a patient name from the inputs, pass --patient"),
	}
}

fn print_summary(report: &BatchReport) {
	for object in &report.objects {
		let source = object.source_path.display();
		match &object.status {
			ObjectStatus::EncodeFailed { error } => println!("{source}: not encoded ({error})"),
			ObjectStatus::Transferred {
				outcome,
				cleanup_error,
				..
			} => {
				println!("{source}: {outcome}");
				if let Some(cleanup_error) = cleanup_error {
					println!("{source}: {cleanup_error}");
				}
			}
		}
	}
	if let Some(association_error) = &report.association_error {
		println!("association: {association_error}");
	}
	println!(
		"{} of {} inputs delivered ({} encoded, {} rejected, {} failed, {} not cleaned up)",
		report.delivered,
		report.objects.len(),
		report.encoded,
		report.rejected,
		report.failed,
		report.deletion_errors
	);
}

use crate::dimse::association::ConnectionParameters;
use crate::transfer::TransferSettings;
use crate::types::{AeTitle, InvalidAeTitle};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "DICOM_COURIER";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	/// Folder the encoded files are written to.
	pub output_folder: PathBuf,
	/// Milliseconds allowed for connecting and for every PDU exchange.
	pub timeout: u64,
	pub pacs: PacsConfig,
	pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacsConfig {
	pub ip: String,
	pub port: u16,
	/// Our own AE title.
	pub aet: String,
	/// AE title of the archive.
	pub called_aet: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Default log level, `RUST_LOG` takes precedence.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: tracing::Level,
	/// Sentry DSN. Error tracking stays off without one.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D: Deserializer<'de>>(deserializer: D) -> Result<tracing::Level, D::Error> {
	let level = String::deserialize(deserializer)?;
	tracing::Level::from_str(&level).map_err(serde::de::Error::custom)
}

impl AppConfig {
	/// Loads the embedded defaults, then `config.toml` (or `file`), then `DICOM_COURIER_*`
	/// environment variables. Nested keys are separated by `__`, e.g. `DICOM_COURIER_PACS__PORT`.
	pub fn new(file: Option<&Path>) -> Result<Self, ConfigError> {
		Self::build(
			file,
			Environment::with_prefix(ENV_PREFIX)
				.prefix_separator("_")
				.separator("__")
				.try_parsing(true),
		)
	}

	fn build(file: Option<&Path>, environment: Environment) -> Result<Self, ConfigError> {
		let user_file = match file {
			Some(path) => File::from(path).required(true),
			None => File::with_name("config.toml").required(false),
		};

		Config::builder()
			.add_source(File::from_str(
				include_str!("defaults.toml"),
				FileFormat::Toml,
			))
			.add_source(user_file)
			.add_source(environment)
			.build()?
			.try_deserialize()
	}

	pub fn connection_parameters(&self) -> Result<ConnectionParameters, InvalidAeTitle> {
		Ok(ConnectionParameters {
			host: self.pacs.ip.clone(),
			port: self.pacs.port,
			calling_ae_title: AeTitle::new(&self.pacs.aet)?,
			called_ae_title: AeTitle::new(&self.pacs.called_aet)?,
		})
	}

	pub fn transfer_settings(&self) -> Result<TransferSettings, InvalidAeTitle> {
		Ok(TransferSettings {
			output_dir: self.output_folder.clone(),
			connection: self.connection_parameters()?,
			timeout: Duration::from_millis(self.timeout),
		})
	}
}

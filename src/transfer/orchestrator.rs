use super::{AssociationClient, TransferOutcome};
use crate::dimse::association::{AssociationError, ConnectionParameters, Connector};
use crate::encoder::{
	DatasetEncoder, EncodeError, EncodedObject, ImageSource, SeriesContext, StudyContext,
};
use crate::uid::UidAllocator;
use chrono::Local;
use serde::{Serialize, Serializer};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Settings fixed for the lifetime of a [`TransferOrchestrator`].
#[derive(Debug, Clone)]
pub struct TransferSettings {
	pub output_dir: PathBuf,
	pub connection: ConnectionParameters,
	pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
	Encoding,
	Transferring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
	pub phase: Phase,
	pub done: usize,
	pub total: usize,
}

#[derive(Debug, Error)]
pub enum CleanupError {
	#[error("Failed to delete {}: {source}", path.display())]
	DeleteFailed {
		path: PathBuf,
		source: std::io::Error,
	},
}

/// What happened to a single input.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ObjectStatus {
	/// The input never reached the network phase.
	EncodeFailed {
		#[serde(serialize_with = "display")]
		error: EncodeError,
	},
	Transferred {
		object: EncodedObject,
		#[serde(flatten)]
		outcome: TransferOutcome,
		#[serde(serialize_with = "display_opt")]
		cleanup_error: Option<CleanupError>,
	},
}

#[derive(Debug, Serialize)]
pub struct ObjectReport {
	pub source_path: PathBuf,
	#[serde(flatten)]
	pub status: ObjectStatus,
}

impl ObjectReport {
	pub const fn outcome(&self) -> Option<&TransferOutcome> {
		match &self.status {
			ObjectStatus::Transferred { outcome, .. } => Some(outcome),
			ObjectStatus::EncodeFailed { .. } => None,
		}
	}
}

/// Summary of one batch. Objects are listed in input order.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
	pub encoded: usize,
	pub delivered: usize,
	pub rejected: usize,
	pub failed: usize,
	pub deletion_errors: usize,
	pub association_error: Option<String>,
	pub objects: Vec<ObjectReport>,
}

impl BatchReport {
	/// True if every input was delivered and its encoded file removed.
	pub fn is_complete(&self) -> bool {
		self.delivered == self.objects.len()
			&& self.deletion_errors == 0
			&& self.association_error.is_none()
	}

	fn tally(&mut self) {
		let mut tally = (0, 0, 0, 0, 0);
		for report in &self.objects {
			match &report.status {
				ObjectStatus::EncodeFailed { .. } => {}
				ObjectStatus::Transferred {
					outcome,
					cleanup_error,
					..
				} => {
					tally.0 += 1;
					match outcome {
						TransferOutcome::Delivered => tally.1 += 1,
						TransferOutcome::Rejected(_) => tally.2 += 1,
						TransferOutcome::Failed(_) => tally.3 += 1,
					}
					if cleanup_error.is_some() {
						tally.4 += 1;
					}
				}
			}
		}
		(
			self.encoded,
			self.delivered,
			self.rejected,
			self.failed,
			self.deletion_errors,
		) = tally;
	}
}

fn display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.collect_str(value)
}

fn display_opt<T: Display, S: Serializer>(
	value: &Option<T>,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	match value {
		Some(value) => serializer.collect_str(value),
		None => serializer.serialize_none(),
	}
}

/// Runs a batch: encode every input, deliver the results over one association, then remove
/// the files the archive accepted.
pub struct TransferOrchestrator<C: Connector> {
	connector: C,
	encoder: DatasetEncoder,
	uids: UidAllocator,
	settings: TransferSettings,
}

impl<C: Connector> TransferOrchestrator<C> {
	pub fn new(connector: C, settings: TransferSettings) -> Self {
		Self {
			connector,
			encoder: DatasetEncoder::default(),
			uids: UidAllocator::default(),
			settings,
		}
	}

	#[instrument(skip_all, fields(inputs = inputs.len()))]
	pub async fn run(
		&self,
		inputs: &[PathBuf],
		patient_name: &str,
		mut on_progress: impl FnMut(Progress),
		cancel: &CancellationToken,
	) -> BatchReport {
		let mut report = BatchReport {
			objects: self.encode_all(inputs, patient_name, &mut on_progress),
			..BatchReport::default()
		};

		let pending: Vec<usize> = report
			.objects
			.iter()
			.enumerate()
			.filter(|(_, entry)| entry.outcome().is_some())
			.map(|(index, _)| index)
			.collect();
		if pending.is_empty() {
			info!("Nothing to transfer");
			report.tally();
			return report;
		}

		report.association_error = self
			.transfer_all(&mut report.objects, &pending, &mut on_progress, cancel)
			.await
			.err()
			.map(|err| err.to_string());

		remove_delivered(&mut report.objects);
		report.tally();
		info!(
			encoded = report.encoded,
			delivered = report.delivered,
			rejected = report.rejected,
			failed = report.failed,
			"Batch finished"
		);
		report
	}

	fn encode_all(
		&self,
		inputs: &[PathBuf],
		patient_name: &str,
		on_progress: &mut impl FnMut(Progress),
	) -> Vec<ObjectReport> {
		let study = StudyContext::new(patient_name, Local::now().naive_local(), &self.uids);
		let series = SeriesContext::new(&self.uids);
		let output_dir = self.settings.output_dir.as_path();
		let prepared = std::fs::create_dir_all(output_dir)
			.map_err(|err| format!("{}: {err}", output_dir.display()));

		let total = inputs.len();
		let mut objects = Vec::with_capacity(total);
		for (index, input) in inputs.iter().enumerate() {
			let encoded = match &prepared {
				Ok(()) => self.encode_one(input, &study, &series, output_dir),
				Err(detail) => Err(EncodeError::WriteFailed(detail.clone())),
			};
			let status = match encoded {
				Ok(object) => ObjectStatus::Transferred {
					object,
					outcome: TransferOutcome::Failed(String::from("not sent")),
					cleanup_error: None,
				},
				Err(error) => {
					warn!(source = %input.display(), "Skipping input: {error}");
					ObjectStatus::EncodeFailed { error }
				}
			};
			objects.push(ObjectReport {
				source_path: input.clone(),
				status,
			});
			on_progress(Progress {
				phase: Phase::Encoding,
				done: index + 1,
				total,
			});
		}
		objects
	}

	fn encode_one(
		&self,
		input: &Path,
		study: &StudyContext,
		series: &SeriesContext,
		output_dir: &Path,
	) -> Result<EncodedObject, EncodeError> {
		let image = ImageSource::open(input)?;
		self.encoder.encode(&image, study, series, output_dir)
	}

	/// Stores the objects at `pending` over a single association. Returns the error of the
	/// association itself; transaction failures end up in the object outcomes.
	async fn transfer_all(
		&self,
		objects: &mut [ObjectReport],
		pending: &[usize],
		on_progress: &mut impl FnMut(Progress),
		cancel: &CancellationToken,
	) -> Result<(), AssociationError> {
		let total = pending.len();
		let mut client = AssociationClient::new(
			&self.connector,
			self.settings.connection.clone(),
			self.settings.timeout,
		);

		let established = tokio::select! {
			biased;
			() = cancel.cancelled() => Err(AssociationError::NotEstablished(String::from("cancelled"))),
			result = client.establish() => result,
		};
		if let Err(err) = established {
			for (done, &index) in pending.iter().enumerate() {
				set_outcome(&mut objects[index], TransferOutcome::not_established(&err));
				on_progress(Progress {
					phase: Phase::Transferring,
					done: done + 1,
					total,
				});
			}
			return Err(err);
		}

		for (done, &index) in pending.iter().enumerate() {
			let outcome = match &objects[index].status {
				ObjectStatus::Transferred { object, .. } if !cancel.is_cancelled() => {
					tokio::select! {
						biased;
						() = cancel.cancelled() => None,
						outcome = client.store_one(object) => Some(outcome),
					}
				}
				_ => Some(TransferOutcome::cancelled()),
			};
			let outcome = outcome.unwrap_or_else(|| {
				// The archive may still answer the abandoned request.
				client.abort("cancelled");
				TransferOutcome::cancelled()
			});
			set_outcome(&mut objects[index], outcome);
			on_progress(Progress {
				phase: Phase::Transferring,
				done: done + 1,
				total,
			});
		}

		client.release().await
	}
}

fn set_outcome(report: &mut ObjectReport, new_outcome: TransferOutcome) {
	if let ObjectStatus::Transferred { outcome, .. } = &mut report.status {
		*outcome = new_outcome;
	}
}

/// Deletes the encoded file of every delivered object. Other files stay for a later retry.
fn remove_delivered(objects: &mut [ObjectReport]) {
	for report in objects {
		let ObjectStatus::Transferred {
			object,
			outcome: TransferOutcome::Delivered,
			cleanup_error,
		} = &mut report.status
		else {
			continue;
		};
		if let Err(source) = std::fs::remove_file(&object.file_path) {
			error!(file = %object.file_path.display(), "Failed to delete delivered file: {source}");
			*cleanup_error = Some(CleanupError::DeleteFailed {
				path: object.file_path.clone(),
				source,
			});
		}
	}
}

//! DICOM message service element (DIMSE) exchange on top of dicom-ul.
//!
//! A message is a command set, always encoded in Implicit VR Little Endian, optionally followed by
//! a data set in the transfer syntax of its presentation context. Both travel as P-DATA-TF PDUs
//! over an [`Association`] and may be split into several fragments.

pub mod association;
pub mod cstore;

use crate::types::{UI, US};
use association::{Association, AssociationError, PresentationContext};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::{TransferSyntax, TransferSyntaxRegistry};
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Value of [`tags::COMMAND_DATA_SET_TYPE`] when a data set follows the command.
/// Peers may use any other value except [`DATA_SET_MISSING`] for the same meaning.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Value of [`tags::COMMAND_DATA_SET_TYPE`] when no data set follows.
pub const DATA_SET_MISSING: US = 0x0101;

/// A command set and its optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	pub command: InMemDicomObject,
	pub data: Option<InMemDicomObject>,
	/// Set on received messages.
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DicomMessage")
			.field("command_field", &self.command_int(tags::COMMAND_FIELD).ok())
			.field("has_data", &self.data.is_some())
			.field("presentation_context_id", &self.presentation_context_id)
			.finish()
	}
}

impl DicomMessage {
	pub fn command_int(&self, tag: Tag) -> Result<US, ReadError> {
		self.command
			.get(tag)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tag))
	}

	fn has_data_set(command: &InMemDicomObject) -> bool {
		command
			.get(tags::COMMAND_DATA_SET_TYPE)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.is_some_and(|value| value != DATA_SET_MISSING)
	}
}

/// Coarse meaning of a DIMSE status code.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl From<US> for StatusType {
	/// Codes outside the ranges of PS3.7 Annex C count as failures.
	fn from(value: US) -> Self {
		match value {
			0x0000 => Self::Success,
			0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Self::Warning,
			0xFE00 => Self::Cancel,
			0xFF00 | 0xFF01 => Self::Pending,
			_ => Self::Failure,
		}
	}
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: u8,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

fn find_context<A: Association>(
	association: &A,
	presentation_context_id: u8,
) -> Result<&PresentationContext, NegotiationError> {
	association
		.presentation_contexts()
		.iter()
		.find(|pctx| pctx.id == presentation_context_id)
		.ok_or(NegotiationError::NoPresentationContext)
}

fn lookup_transfer_syntax(uid: &str) -> Result<&'static TransferSyntax, NegotiationError> {
	TransferSyntaxRegistry
		.get(uid)
		.ok_or_else(|| NegotiationError::UnknownTransferSyntax(UI::from(uid)))
}

/// A single PDV wrapped in its own P-DATA-TF PDU.
fn pdata(value_type: PDataValueType, presentation_context_id: u8, data: Vec<u8>) -> Pdu {
	Pdu::PData {
		data: vec![PDataValue {
			value_type,
			presentation_context_id,
			is_last: true,
			data,
		}],
	}
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: u8,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let DicomMessage { command, data, .. } = message.into();
		let presentation_context = find_context(self, presentation_context_id)?;

		let mut command_buf = Vec::new();
		command.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
		trace!(bytes = command_buf.len(), "Sending command set");
		self.send(
			pdata(PDataValueType::Command, presentation_context.id, command_buf),
			timeout,
		)
		.await?;

		let Some(data) = data else {
			return Ok(());
		};
		let transfer_syntax = lookup_transfer_syntax(&presentation_context.transfer_syntax)?;
		let mut data_buf = Vec::new();
		data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;
		// The association splits this into PDUs of the negotiated maximum length.
		trace!(bytes = data_buf.len(), "Sending data set");
		self.send(
			pdata(PDataValueType::Data, presentation_context.id, data_buf),
			timeout,
		)
		.await?;
		Ok(())
	}
}

/// Collects PDV fragments until a complete message is available.
#[derive(Default)]
struct MessageAssembler {
	command_fragments: Vec<u8>,
	data_fragments: Vec<u8>,
	/// A complete command set that still waits for its data set.
	command: Option<InMemDicomObject>,
}

/// The parts of a message before the data set is decoded.
struct AssembledMessage {
	command: InMemDicomObject,
	data: Option<Vec<u8>>,
	presentation_context_id: u8,
}

impl MessageAssembler {
	fn push(&mut self, mut pdv: PDataValue) -> Result<Option<AssembledMessage>, ReadError> {
		trace!(
			value_type = ?pdv.value_type,
			is_last = pdv.is_last,
			"Received fragment"
		);
		match pdv.value_type {
			PDataValueType::Command => {
				if self.command.is_some() {
					return Err(ReadError::OutOfOrder);
				}
				self.command_fragments.append(&mut pdv.data);
				if !pdv.is_last {
					return Ok(None);
				}

				let command = InMemDicomObject::read_dataset_with_ts(
					self.command_fragments.as_slice(),
					&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
				)?;
				if DicomMessage::has_data_set(&command) {
					self.command = Some(command);
					return Ok(None);
				}
				Ok(Some(AssembledMessage {
					command,
					data: None,
					presentation_context_id: pdv.presentation_context_id,
				}))
			}
			PDataValueType::Data => {
				if self.command.is_none() {
					return Err(ReadError::OutOfOrder);
				}
				self.data_fragments.append(&mut pdv.data);
				if !pdv.is_last {
					return Ok(None);
				}

				let command = self.command.take().ok_or(ReadError::OutOfOrder)?;
				Ok(Some(AssembledMessage {
					command,
					data: Some(std::mem::take(&mut self.data_fragments)),
					presentation_context_id: pdv.presentation_context_id,
				}))
			}
		}
	}
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut assembler = MessageAssembler::default();

		loop {
			let data = match self.receive(timeout).await? {
				Pdu::PData { data } => data,
				pdu => return Err(ReadError::UnexpectedPdu(pdu)),
			};

			for pdv in data {
				let Some(message) = assembler.push(pdv)? else {
					continue;
				};

				let data = match message.data {
					Some(bytes) => {
						let presentation_context =
							find_context(self, message.presentation_context_id)?;
						let transfer_syntax =
							lookup_transfer_syntax(&presentation_context.transfer_syntax)?;
						Some(InMemDicomObject::read_dataset_with_ts(
							bytes.as_slice(),
							transfer_syntax,
						)?)
					}
					None => None,
				};
				return Ok(DicomMessage {
					command: message.command,
					data,
					presentation_context_id: Some(message.presentation_context_id),
				});
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
	#[error("Unexpected command field {0:#06x}")]
	UnexpectedCommand(US),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

/// Returns a new message id. Ids start at 1 and wrap around.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

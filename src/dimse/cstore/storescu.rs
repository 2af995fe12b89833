use crate::dimse::association::Association;
use crate::dimse::cstore::{CompositeStoreRequest, CompositeStoreResponse};
use crate::dimse::{
	next_message_id, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError,
};
use crate::types::{PRIORITY_MEDIUM, UI, US};
use dicom::object::{FileDicomObject, InMemDicomObject};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, trace};

/// Service class user for the storage SOP classes.
/// It sends a C-STORE-RQ with the data set and waits for the matching C-STORE-RSP.
pub struct StoreServiceClassUser<'a, A: Association> {
	association: &'a A,
	presentation_context_id: u8,
	timeout: Duration,
}

impl<'a, A: Association> StoreServiceClassUser<'a, A> {
	pub const fn new(association: &'a A, presentation_context_id: u8, timeout: Duration) -> Self {
		Self {
			association,
			presentation_context_id,
			timeout,
		}
	}

	/// Stores a single instance and returns the status of the C-STORE-RSP.
	#[instrument(skip_all)]
	pub async fn store(&self, file: FileDicomObject<InMemDicomObject>) -> Result<US, StoreError> {
		let message_id = next_message_id();
		let sop_instance_uid = UI::from(file.meta().media_storage_sop_instance_uid());
		let request = CompositeStoreRequest {
			affected_sop_class_uid: UI::from(file.meta().media_storage_sop_class_uid()),
			affected_sop_instance_uid: sop_instance_uid.clone(),
			priority: PRIORITY_MEDIUM,
			message_id,
			data_set: file.into_inner(),
		};

		trace!(message_id, sop_instance_uid, "Sending C-STORE-RQ");
		self.association
			.write_message(request, self.presentation_context_id, self.timeout)
			.await?;

		let response = self.association.read_message(self.timeout).await?;
		let response = CompositeStoreResponse::try_from(response)?;

		if response.message_id_being_responded_to != message_id {
			return Err(StoreError::MessageIdMismatch {
				expected: message_id,
				actual: response.message_id_being_responded_to,
			});
		}
		if let Some(affected) = &response.affected_sop_instance_uid {
			if *affected != sop_instance_uid {
				return Err(StoreError::InstanceMismatch(affected.clone()));
			}
		}

		let status_type = StatusType::from(response.status);
		debug!(
			status = response.status,
			sop_instance_uid,
			"Received C-STORE-RSP ({status_type:?})"
		);
		Ok(response.status)
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error("C-STORE-RSP answers message {actual}, expected {expected}")]
	MessageIdMismatch { expected: US, actual: US },
	#[error("C-STORE-RSP refers to a different instance {0}")]
	InstanceMismatch(UI),
}

impl StoreError {
	/// True if the PDU stream may be out of step with the request, so no further message can be
	/// exchanged on the association.
	pub const fn breaks_session(&self) -> bool {
		matches!(self, Self::Read(_) | Self::Write(_))
	}
}

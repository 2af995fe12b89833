use super::TransferOutcome;
use crate::dimse::association::{
	Association, AssociationError, ConnectionParameters, Connector, PresentationParameter,
};
use crate::dimse::cstore::storescu::StoreServiceClassUser;
use crate::encoder::{EncodedObject, SOP_CLASS_UID, TRANSFER_SYNTAX_UID};
use crate::types::US;
use dicom::object::open_file;
use dicom::ul::association::Error as UpperLayerError;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const STATUS_SUCCESS: US = 0x0000;

/// Lifecycle of one network session.
///
/// `Idle -> Negotiating -> Established -> Releasing -> Closed`, with `Failed` reachable from
/// every state that talks to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
	Idle,
	Negotiating,
	Established,
	Releasing,
	Closed,
	Failed,
}

/// Sends encoded objects over a single association.
pub struct AssociationClient<'c, C: Connector> {
	connector: &'c C,
	parameters: ConnectionParameters,
	timeout: Duration,
	state: SessionState,
	association: Option<C::Association>,
	presentation_context_id: u8,
	/// Why the association was aborted.
	abort_reason: Option<String>,
}

impl<'c, C: Connector> AssociationClient<'c, C> {
	pub const fn new(connector: &'c C, parameters: ConnectionParameters, timeout: Duration) -> Self {
		Self {
			connector,
			parameters,
			timeout,
			state: SessionState::Idle,
			association: None,
			presentation_context_id: 0,
			abort_reason: None,
		}
	}

	#[cfg(test)]
	pub const fn state(&self) -> SessionState {
		self.state
	}

	/// Negotiates an association proposing the Secondary Capture storage class with
	/// Explicit VR Little Endian as the only transfer syntax.
	#[instrument(skip_all, fields(host = %self.parameters.host, port = self.parameters.port))]
	pub async fn establish(&mut self) -> Result<(), AssociationError> {
		if self.state != SessionState::Idle {
			return Err(AssociationError::NotEstablished(format!(
				"session is {:?}",
				self.state
			)));
		}
		self.state = SessionState::Negotiating;

		let presentation = PresentationParameter {
			abstract_syntax_uid: SOP_CLASS_UID.to_owned(),
			transfer_syntax_uid: TRANSFER_SYNTAX_UID.to_owned(),
		};
		let connected = self
			.connector
			.connect(&self.parameters, &presentation, self.timeout)
			.await
			.map_err(|err| match err {
				AssociationError::Transport(
					ref source @ (UpperLayerError::Rejected { .. }
					| UpperLayerError::NoAcceptedPresentationContexts { .. }),
				) => AssociationError::Rejected(source.to_string()),
				AssociationError::Rejected(_) | AssociationError::NotEstablished(_) => err,
				err => AssociationError::NotEstablished(err.to_string()),
			})
			.and_then(|association| {
				accepted_context(&association).map(|context_id| (association, context_id))
			});

		match connected {
			Ok((association, context_id)) => {
				self.association = Some(association);
				self.presentation_context_id = context_id;
				self.state = SessionState::Established;
				info!(
					calling_ae_title = %self.parameters.calling_ae_title,
					called_ae_title = %self.parameters.called_ae_title,
					"Association established"
				);
				Ok(())
			}
			Err(err) => {
				self.state = SessionState::Failed;
				warn!("Association could not be established: {err}");
				Err(err)
			}
		}
	}

	/// Performs one C-STORE transaction.
	///
	/// A rejection or an unreadable file only affects this object. A transport failure aborts the
	/// association, and every later call fails without contacting the peer.
	#[instrument(skip_all, fields(sop_instance_uid = %object.sop_instance_uid))]
	pub async fn store_one(&mut self, object: &EncodedObject) -> TransferOutcome {
		let association = match (&self.association, self.state, &self.abort_reason) {
			(Some(association), SessionState::Established, _) => association,
			(_, _, Some(reason)) => {
				return TransferOutcome::Failed(format!("not sent, association aborted ({reason})"));
			}
			_ => return TransferOutcome::Failed(String::from("association not established")),
		};

		let file = match open_file(&object.file_path) {
			Ok(file) => file,
			Err(err) => {
				return TransferOutcome::Failed(format!(
					"failed to read {}: {err}",
					object.file_path.display()
				));
			}
		};
		let transfer_syntax = file.meta().transfer_syntax();
		if transfer_syntax != TRANSFER_SYNTAX_UID {
			return TransferOutcome::Failed(format!(
				"file is encoded in {transfer_syntax}, negotiated {TRANSFER_SYNTAX_UID}"
			));
		}

		let storescu =
			StoreServiceClassUser::new(association, self.presentation_context_id, self.timeout);
		match storescu.store(file).await {
			Ok(STATUS_SUCCESS) => {
				info!("Object delivered");
				TransferOutcome::Delivered
			}
			Ok(status) => {
				warn!("Object rejected with status {status:#06x}");
				TransferOutcome::Rejected(status)
			}
			Err(err) if err.breaks_session() => {
				warn!("Store transaction failed, aborting the association: {err}");
				let detail = err.to_string();
				self.abort(&detail);
				TransferOutcome::Failed(detail)
			}
			Err(err) => {
				warn!("Store transaction failed: {err}");
				TransferOutcome::Failed(err.to_string())
			}
		}
	}

	/// Drops the connection without a release exchange. Used when a transaction was abandoned
	/// and the peer may still answer it.
	pub fn abort(&mut self, reason: &str) {
		if let Some(mut association) = self.association.take() {
			association.close();
		}
		self.state = SessionState::Failed;
		self.abort_reason = Some(reason.to_owned());
	}

	/// Releases the association. Must be called once after the last transaction.
	#[instrument(skip_all)]
	pub async fn release(&mut self) -> Result<(), AssociationError> {
		if let Some(reason) = &self.abort_reason {
			return Err(AssociationError::Aborted(reason.clone()));
		}
		if self.state != SessionState::Established {
			return Err(AssociationError::NotEstablished(format!(
				"session is {:?}",
				self.state
			)));
		}
		let Some(mut association) = self.association.take() else {
			self.state = SessionState::Failed;
			return Err(AssociationError::NotEstablished(String::from(
				"association is gone",
			)));
		};

		self.state = SessionState::Releasing;
		match association.release(self.timeout).await {
			Ok(()) => {
				self.state = SessionState::Closed;
				debug!("Association released");
				Ok(())
			}
			Err(err) => {
				self.state = SessionState::Failed;
				association.close();
				warn!("Failed to release association: {err}");
				Err(err)
			}
		}
	}
}

/// Returns the id of the accepted presentation context, or why the peer's answer is unusable.
fn accepted_context<A: Association>(association: &A) -> Result<u8, AssociationError> {
	let contexts = association.presentation_contexts();
	if let Some(context) = contexts
		.iter()
		.find(|pctx| pctx.transfer_syntax == TRANSFER_SYNTAX_UID)
	{
		return Ok(context.id);
	}

	match contexts.first() {
		Some(context) => Err(AssociationError::Rejected(format!(
			"peer accepted transfer syntax {} instead of {TRANSFER_SYNTAX_UID}",
			context.transfer_syntax
		))),
		None => Err(AssociationError::Rejected(String::from(
			"no presentation context accepted",
		))),
	}
}

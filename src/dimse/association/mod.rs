use crate::types::{AeTitle, UI};
use dicom::ul::Pdu;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

pub mod client;

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error("Association rejected: {0}")]
	Rejected(String),
	#[error("Association not established: {0}")]
	NotEstablished(String),
	#[error("Association aborted: {0}")]
	Aborted(String),
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("Failed to spawn thread")]
	OsThread(std::io::Error),
	#[error("Failed to write P-DATA chunk: {0}")]
	ChunkWriter(std::io::Error),
	#[error(transparent)]
	Transport(#[from] dicom::ul::association::Error),
}

/// A presentation context accepted by the remote application entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
	pub id: u8,
	pub transfer_syntax: UI,
}

/// An established association with a remote application entity.
pub trait Association {
	fn receive(
		&self,
		timeout: Duration,
	) -> impl Future<Output = Result<Pdu, AssociationError>> + Send;

	fn send(
		&self,
		pdu: Pdu,
		timeout: Duration,
	) -> impl Future<Output = Result<(), AssociationError>> + Send;

	/// Exchanges A-RELEASE-RQ/A-RELEASE-RP with the peer. The association is unusable afterwards.
	fn release(
		&mut self,
		timeout: Duration,
	) -> impl Future<Output = Result<(), AssociationError>> + Send;

	fn close(&mut self);

	fn presentation_contexts(&self) -> &[PresentationContext];
}

/// Parameters of an outgoing association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
	pub host: String,
	pub port: u16,
	pub calling_ae_title: AeTitle,
	pub called_ae_title: AeTitle,
}

/// A single abstract syntax with the transfer syntax proposed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationParameter {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uid: UI,
}

/// Opens associations. Implemented by the DICOM upper layer client and by test doubles.
pub trait Connector {
	type Association: Association + Send + Sync;

	fn connect(
		&self,
		parameters: &ConnectionParameters,
		presentation: &PresentationParameter,
		timeout: Duration,
	) -> impl Future<Output = Result<Self::Association, AssociationError>> + Send;
}

/// Requests handled by the thread that owns a blocking association.
#[derive(Debug)]
pub enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
	Release(oneshot::Sender<Result<(), AssociationError>>),
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Timed out")]
	Timeout,
	#[error("Channel is closed")]
	Closed,
}

/// Request/response over an mpsc channel: the request carries a oneshot sender for the reply.
pub trait AskPattern<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError>;
}

impl<T> AskPattern<T> for Sender<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T,
		timeout: Duration,
	) -> Result<R, ChannelError> {
		let (tx, rx) = oneshot::channel();
		tokio::time::timeout(timeout, async {
			self.send(command(tx))
				.await
				.map_err(|_| ChannelError::Closed)?;

			rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
	}
}

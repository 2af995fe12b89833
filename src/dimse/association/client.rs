use dicom::ul::pdu::PDataValueType;
use dicom::ul::Pdu;
use std::convert::identity;
use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
	AskPattern, Association, AssociationError, ChannelError, Command, ConnectionParameters,
	Connector, PresentationContext, PresentationParameter,
};

/// A client association backed by the blocking dicom-ul implementation.
///
/// All I/O happens on a dedicated thread that is driven through a command channel, so callers
/// can bound every exchange with a timeout.
pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContext>,
}

pub struct ClientAssociationOptions {
	pub calling_aet: String,
	pub called_aet: String,
	pub abstract_syntax: String,
	pub transfer_syntaxes: Vec<String>,
	pub host: String,
	pub port: u16,
}

impl ClientAssociation {
	pub async fn new(
		options: ClientAssociationOptions,
		timeout: Duration,
	) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = format!("{}:{}", options.host, options.port);
		let thread_name = format!("{}->{}", options.calling_aet, options.called_aet);
		let options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet)
			.with_presentation_context(options.abstract_syntax, options.transfer_syntaxes);

		let _handle = thread::Builder::new()
			.name(thread_name)
			.spawn(move || {
				let mut association = match options.establish_with(&address) {
					Ok(mut association) => {
						let presentation_contexts = association
							.presentation_contexts()
							.iter()
							.map(|pctx| PresentationContext {
								id: pctx.id,
								transfer_syntax: pctx
									.transfer_syntax
									.trim_end_matches(['\0', ' '])
									.to_owned(),
							})
							.collect::<Vec<_>>();

						let stream = match association.inner_stream().try_clone() {
							Ok(stream) => stream,
							Err(e) => {
								error!(backend_uuid = uuid.to_string(), "Failed to clone TcpStream: {e}");
								connect_tx.send(Err(AssociationError::OsThread(e))).map_err(|_| ())?;
								return Err(());
							}
						};

						connect_tx
							.send(Ok((stream, presentation_contexts)))
							.map_err(|_| ())?;

						association
					}
					Err(e) => {
						error!(backend_uuid = uuid.to_string(), "Failed to connect: {e}");
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let collected = match command {
						Command::Send(pdu, reply_to) => {
							reply_to.send(send_pdu(&mut association, &pdu)).is_ok()
						}
						Command::Receive(reply_to) => {
							let receive_result =
								association.receive().map_err(AssociationError::Transport);
							reply_to.send(receive_result).is_ok()
						}
						Command::Release(reply_to) => {
							let release_result =
								association.release().map_err(AssociationError::Transport);
							debug!(backend_uuid = uuid.to_string(), "Released ClientAssociation");
							return reply_to.send(release_result).map_err(|_| ());
						}
					};
					if !collected {
						// The caller gave up on this exchange, so the PDU stream no longer
						// lines up with its requests.
						warn!(
							backend_uuid = uuid.to_string(),
							"Reply was not collected, aborting ClientAssociation"
						);
						break;
					}
				}

				rx.close();

				if let Err(err) = association.abort() {
					debug!(
						backend_uuid = uuid.to_string(),
						"Failed to abort ClientAssociation: {err}"
					);
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) = tokio::time::timeout(timeout, connect_result)
			.await
			.map_err(|_| ChannelError::Timeout)?
			.map_err(|_| ChannelError::Closed)??;

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
		})
	}

	pub fn uuid(&self) -> &Uuid {
		&self.uuid
	}
}

/// Sends a PDU. Data values are written through a P-DATA writer, which fragments them to the
/// peer's maximum PDU length.
fn send_pdu(
	association: &mut dicom::ul::ClientAssociation<TcpStream>,
	pdu: &Pdu,
) -> Result<(), AssociationError> {
	match pdu {
		Pdu::PData { data } if data.iter().all(|pdv| pdv.value_type == PDataValueType::Data) => {
			data.iter().try_for_each(|pdv| {
				let mut writer = association.send_pdata(pdv.presentation_context_id);
				writer
					.write_all(&pdv.data)
					.map_err(AssociationError::ChunkWriter)?;
				writer.finish().map_err(AssociationError::ChunkWriter)
			})
		}
		_ => association.send(pdu).map_err(AssociationError::Transport),
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn release(&mut self, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(Command::Release, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContext] {
		&self.presentation_contexts
	}
}

/// Opens [`ClientAssociation`]s over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpperLayerConnector;

impl Connector for UpperLayerConnector {
	type Association = ClientAssociation;

	async fn connect(
		&self,
		parameters: &ConnectionParameters,
		presentation: &PresentationParameter,
		timeout: Duration,
	) -> Result<Self::Association, AssociationError> {
		let options = ClientAssociationOptions {
			calling_aet: parameters.calling_ae_title.to_string(),
			called_aet: parameters.called_ae_title.to_string(),
			abstract_syntax: presentation.abstract_syntax_uid.clone(),
			transfer_syntaxes: vec![presentation.transfer_syntax_uid.clone()],
			host: parameters.host.clone(),
			port: parameters.port,
		};

		let association = ClientAssociation::new(options, timeout).await?;
		info!(
			backend_uuid = association.uuid().to_string(),
			host = parameters.host,
			port = parameters.port,
			"Created new client association"
		);
		Ok(association)
	}
}

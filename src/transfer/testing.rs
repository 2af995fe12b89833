//! Scripted association used by the transfer tests.

use crate::dimse::association::{
	Association, AssociationError, ChannelError, ConnectionParameters, Connector,
	PresentationContext, PresentationParameter,
};
use crate::dimse::cstore::CompositeStoreResponse;
use crate::dimse::DicomMessage;
use crate::encoder::{
	DatasetEncoder, EncodedObject, ImageSource, SeriesContext, StudyContext, SOP_CLASS_UID,
	TRANSFER_SYNTAX_UID,
};
use crate::types::{AeTitle, UI, US};
use crate::uid::UidAllocator;
use chrono::NaiveDateTime;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries::{EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN};
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::pdu::DEFAULT_MAX_PDU;
use dicom::ul::{Pdu, ServerAssociation, ServerAssociationOptions};
use std::collections::VecDeque;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const CONTEXT_ID: u8 = 1;

/// What the peer does with the next C-STORE-RQ.
#[derive(Debug, Clone, Copy)]
pub enum Step {
	/// Answer with the given status.
	Respond(US),
	/// Answer with the given status but for another message id.
	RespondToOther(US),
	/// Accept the request but never answer. Reads wait for the full timeout.
	Silent,
	/// Break the connection while the command is sent.
	Drop,
}

#[derive(Debug, Clone, Default)]
pub struct Log {
	pub connects: usize,
	/// SOP instance UIDs of the data sets received, in order.
	pub stored: Vec<UI>,
	pub releases: usize,
	/// Connections dropped without a release.
	pub aborts: usize,
}

#[derive(Default)]
struct Peer {
	script: VecDeque<Step>,
	current: Option<(US, Step)>,
	pending: Option<CompositeStoreResponse>,
	log: Log,
}

#[derive(Clone)]
pub struct MockConnector {
	peer: Arc<Mutex<Peer>>,
	accepted_transfer_syntax: Option<UI>,
	fail_release: bool,
}

impl MockConnector {
	pub fn accepting(script: impl IntoIterator<Item = Step>) -> Self {
		Self::accepting_syntax(TRANSFER_SYNTAX_UID, script)
	}

	pub fn accepting_syntax(transfer_syntax: &str, script: impl IntoIterator<Item = Step>) -> Self {
		Self {
			peer: Arc::new(Mutex::new(Peer {
				script: script.into_iter().collect(),
				..Peer::default()
			})),
			accepted_transfer_syntax: Some(UI::from(transfer_syntax)),
			fail_release: false,
		}
	}

	pub fn refusing() -> Self {
		Self {
			peer: Arc::default(),
			accepted_transfer_syntax: None,
			fail_release: false,
		}
	}

	pub fn failing_release(mut self) -> Self {
		self.fail_release = true;
		self
	}

	pub fn parameters(&self) -> ConnectionParameters {
		ConnectionParameters {
			host: String::from("127.0.0.1"),
			port: 11112,
			calling_ae_title: AeTitle::new("COURIER").unwrap(),
			called_ae_title: AeTitle::new("ANY-SCP").unwrap(),
		}
	}

	pub fn log(&self) -> Log {
		self.peer.lock().unwrap().log.clone()
	}
}

impl Connector for MockConnector {
	type Association = MockAssociation;

	async fn connect(
		&self,
		_parameters: &ConnectionParameters,
		_presentation: &PresentationParameter,
		_timeout: Duration,
	) -> Result<Self::Association, AssociationError> {
		self.peer.lock().unwrap().log.connects += 1;
		let transfer_syntax = self
			.accepted_transfer_syntax
			.clone()
			.ok_or(AssociationError::Channel(ChannelError::Closed))?;

		Ok(MockAssociation {
			peer: Arc::clone(&self.peer),
			presentation_contexts: vec![PresentationContext {
				id: CONTEXT_ID,
				transfer_syntax,
			}],
			fail_release: self.fail_release,
		})
	}
}

pub struct MockAssociation {
	peer: Arc<Mutex<Peer>>,
	presentation_contexts: Vec<PresentationContext>,
	fail_release: bool,
}

impl Association for MockAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		let response = self.peer.lock().unwrap().pending.take();
		let Some(response) = response else {
			tokio::time::sleep(timeout).await;
			return Err(AssociationError::Channel(ChannelError::Timeout));
		};

		let mut data = Vec::new();
		DicomMessage::from(response)
			.command
			.write_dataset_with_ts(&mut data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
			.unwrap();
		Ok(Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: CONTEXT_ID,
				is_last: true,
				data,
			}],
		})
	}

	async fn send(&self, pdu: Pdu, _timeout: Duration) -> Result<(), AssociationError> {
		let Pdu::PData { data } = pdu else {
			return Ok(());
		};

		let mut peer = self.peer.lock().unwrap();
		for pdv in data {
			match pdv.value_type {
				PDataValueType::Command => {
					let command = InMemDicomObject::read_dataset_with_ts(
						pdv.data.as_slice(),
						&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
					)
					.unwrap();
					let message_id = command
						.element(tags::MESSAGE_ID)
						.unwrap()
						.to_int::<US>()
						.unwrap();
					match peer.script.pop_front() {
						Some(Step::Drop) => {
							return Err(AssociationError::Channel(ChannelError::Closed));
						}
						step => peer.current = step.map(|step| (message_id, step)),
					}
				}
				PDataValueType::Data => {
					let data_set = InMemDicomObject::read_dataset_with_ts(
						pdv.data.as_slice(),
						&EXPLICIT_VR_LITTLE_ENDIAN.erased(),
					)
					.unwrap();
					let sop_instance_uid = data_set
						.element(tags::SOP_INSTANCE_UID)
						.unwrap()
						.to_str()
						.unwrap()
						.trim_end_matches(['\0', ' '])
						.to_owned();
					peer.log.stored.push(sop_instance_uid.clone());

					let (message_id, status) = match peer.current.take() {
						Some((message_id, Step::Respond(status))) => (message_id, status),
						Some((message_id, Step::RespondToOther(status))) => {
							(message_id.wrapping_add(1), status)
						}
						_ => continue,
					};
					peer.pending = Some(CompositeStoreResponse {
						message_id_being_responded_to: message_id,
						affected_sop_instance_uid: Some(sop_instance_uid),
						status,
					});
				}
			}
		}
		Ok(())
	}

	async fn release(&mut self, _timeout: Duration) -> Result<(), AssociationError> {
		self.peer.lock().unwrap().log.releases += 1;
		if self.fail_release {
			return Err(AssociationError::Channel(ChannelError::Timeout));
		}
		Ok(())
	}

	fn close(&mut self) {
		self.peer.lock().unwrap().log.aborts += 1;
	}

	fn presentation_contexts(&self) -> &[PresentationContext] {
		&self.presentation_contexts
	}
}

fn rgb_image(path: PathBuf, width: u32, height: u32) -> ImageSource {
	ImageSource {
		path,
		width,
		height,
		channels: 3,
		pixels: (0..width * height * 3).map(|i| i as u8).collect(),
	}
}

/// Encodes `count` images of `width` x `height` pixels into `dir`.
pub fn encode_sized(dir: &Path, count: usize, width: u32, height: u32) -> Vec<EncodedObject> {
	let uids = UidAllocator::default();
	let captured_at =
		NaiveDateTime::parse_from_str("2024-03-05 14:07:09", "%Y-%m-%d %H:%M:%S").unwrap();
	let study = StudyContext::new("DOE^JANE", captured_at, &uids);
	let series = SeriesContext::new(&uids);
	let encoder = DatasetEncoder::default();

	(0..count)
		.map(|i| {
			let image = rgb_image(PathBuf::from(format!("capture-{i}.png")), width, height);
			encoder.encode(&image, &study, &series, dir).unwrap()
		})
		.collect()
}

/// Encodes `count` small images into `dir`.
pub fn encode_batch(dir: &Path, count: usize) -> Vec<EncodedObject> {
	encode_sized(dir, count, 4, 2)
}

/// Writes `count` PNG files named `photo-<n>.png` into `dir`.
pub fn write_images(dir: &Path, count: usize) -> Vec<PathBuf> {
	(0..count)
		.map(|i| {
			let path = dir.join(format!("photo-{i}.png"));
			image::RgbImage::from_fn(3, 2, |x, y| image::Rgb([x as u8, y as u8, i as u8]))
				.save(&path)
				.unwrap();
			path
		})
		.collect()
}

/// A storage SCP on a loopback socket, run by dicom-ul on its own thread. It accepts a single
/// association and answers C-STORE-RQs following a script of [`Step`]s.
pub struct LoopbackArchive {
	port: u16,
	handle: thread::JoinHandle<Log>,
}

impl LoopbackArchive {
	/// An archive accepting Secondary Capture in Explicit VR Little Endian.
	pub fn start(script: impl IntoIterator<Item = Step>) -> Self {
		Self::start_with(SOP_CLASS_UID, DEFAULT_MAX_PDU, script)
	}

	pub fn start_with(
		abstract_syntax: &str,
		max_pdu_length: u32,
		script: impl IntoIterator<Item = Step>,
	) -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		let abstract_syntax = abstract_syntax.to_owned();
		let script: VecDeque<Step> = script.into_iter().collect();

		let handle = thread::spawn(move || {
			let mut log = Log::default();
			let (socket, _) = listener.accept().unwrap();
			let options = ServerAssociationOptions::new()
				.accept_any()
				.ae_title("ANY-SCP")
				.with_abstract_syntax(abstract_syntax)
				.with_transfer_syntax(TRANSFER_SYNTAX_UID)
				.max_pdu_length(max_pdu_length);
			let Ok(mut association) = options.establish(socket) else {
				return log;
			};
			log.connects += 1;
			serve(&mut association, script, &mut log);
			log
		});

		Self { port, handle }
	}

	pub fn parameters(&self) -> ConnectionParameters {
		ConnectionParameters {
			host: String::from("127.0.0.1"),
			port: self.port,
			calling_ae_title: AeTitle::new("COURIER").unwrap(),
			called_ae_title: AeTitle::new("ANY-SCP").unwrap(),
		}
	}

	/// Waits for the association to end and returns what the archive saw.
	pub fn finish(self) -> Log {
		self.handle.join().unwrap()
	}
}

fn serve(association: &mut ServerAssociation<TcpStream>, mut script: VecDeque<Step>, log: &mut Log) {
	let mut command_bytes = Vec::new();
	let mut data_bytes = Vec::new();
	let mut command = None;

	loop {
		let data = match association.receive() {
			Ok(Pdu::PData { data }) => data,
			Ok(Pdu::ReleaseRQ) => {
				log.releases += 1;
				association.send(&Pdu::ReleaseRP).unwrap();
				return;
			}
			Ok(_) | Err(_) => {
				log.aborts += 1;
				return;
			}
		};

		for pdv in data {
			let context_id = pdv.presentation_context_id;
			match pdv.value_type {
				PDataValueType::Command => {
					command_bytes.extend(pdv.data);
					if pdv.is_last {
						command = Some(
							InMemDicomObject::read_dataset_with_ts(
								std::mem::take(&mut command_bytes).as_slice(),
								&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
							)
							.unwrap(),
						);
					}
				}
				PDataValueType::Data => {
					data_bytes.extend(pdv.data);
					if !pdv.is_last {
						continue;
					}
					let request: InMemDicomObject = command.take().unwrap();
					let data_set = InMemDicomObject::read_dataset_with_ts(
						std::mem::take(&mut data_bytes).as_slice(),
						&EXPLICIT_VR_LITTLE_ENDIAN.erased(),
					)
					.unwrap();
					let message_id = request
						.element(tags::MESSAGE_ID)
						.unwrap()
						.to_int::<US>()
						.unwrap();
					let sop_instance_uid = data_set
						.element(tags::SOP_INSTANCE_UID)
						.unwrap()
						.to_str()
						.unwrap()
						.trim_end_matches(['\0', ' '])
						.to_owned();
					log.stored.push(sop_instance_uid.clone());

					let status = match script.pop_front() {
						Some(Step::Respond(status)) => status,
						_ => continue,
					};
					let mut response = Vec::new();
					DicomMessage::from(CompositeStoreResponse {
						message_id_being_responded_to: message_id,
						affected_sop_instance_uid: Some(sop_instance_uid),
						status,
					})
					.command
					.write_dataset_with_ts(&mut response, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
					.unwrap();
					association
						.send(&Pdu::PData {
							data: vec![PDataValue {
								value_type: PDataValueType::Command,
								presentation_context_id: context_id,
								is_last: true,
								data: response,
							}],
						})
						.unwrap();
				}
			}
		}
	}
}

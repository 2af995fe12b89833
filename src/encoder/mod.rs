//! Turns decoded raster images into DICOM Part 10 files.
//!
//! Every file is written with the same explicitly declared transfer syntax
//! ([`TRANSFER_SYNTAX_UID`]). The data set is serialized by dicom-object using the transfer
//! syntax stored in the file meta group, so the declaration and the encoding of the body
//! always agree.

mod attributes;
mod raster;

pub use attributes::{SecondaryCaptureImage, SOP_CLASS_UID};
pub use raster::ImageSource;

use crate::types::UI;
use crate::uid::UidAllocator;
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use chrono::NaiveDateTime;
use dicom::dictionary_std::uids;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::{debug, instrument};

/// Explicit VR Little Endian, the only transfer syntax used for files and for the network.
pub const TRANSFER_SYNTAX_UID: &str = uids::EXPLICIT_VR_LITTLE_ENDIAN;

/// File extension of encoded objects.
pub const DICOM_EXTENSION: &str = "dcm";

/// Patient and study level attributes shared by all objects of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyContext {
	pub patient_name: String,
	pub patient_id: String,
	pub study_uid: UI,
	pub study_date: String,
	pub study_time: String,
}

impl StudyContext {
	/// The patient ID as well as the study date and time are derived from the capture instant.
	pub fn new(patient_name: &str, captured_at: NaiveDateTime, uids: &UidAllocator) -> Self {
		Self {
			patient_name: patient_name.trim().to_owned(),
			patient_id: format!("ID-{}", captured_at.format("%Y%m%d%H%M%S")),
			study_uid: uids.allocate(),
			study_date: captured_at.format("%Y%m%d").to_string(),
			study_time: captured_at.format("%H%M%S").to_string(),
		}
	}
}

/// Series level attributes shared by all objects of a batch.
#[derive(Debug)]
pub struct SeriesContext {
	pub series_uid: UI,
	instances: AtomicU32,
}

impl SeriesContext {
	pub fn new(uids: &UidAllocator) -> Self {
		Self {
			series_uid: uids.allocate(),
			instances: AtomicU32::new(0),
		}
	}

	/// 1-based number of the next instance in this series.
	pub fn next_instance_number(&self) -> u32 {
		self.instances.fetch_add(1, Ordering::Relaxed) + 1
	}
}

/// A DICOM file written by the [`DatasetEncoder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedObject {
	pub sop_instance_uid: UI,
	pub sop_class_uid: UI,
	pub file_path: PathBuf,
	pub source_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum EncodeError {
	#[error("Failed to decode image: {0}")]
	DecodeFailed(String),
	#[error("Failed to write DICOM file: {0}")]
	WriteFailed(String),
	#[error("Refusing to overwrite existing file {}", .0.display())]
	ConflictError(PathBuf),
}

#[derive(Debug, Default)]
pub struct DatasetEncoder {
	uids: UidAllocator,
}

impl DatasetEncoder {
	/// Encodes `image` into `<output_dir>/<source stem>.dcm`.
	///
	/// The file is first written under a temporary name in `output_dir` and then moved to
	/// its final name, which must not exist yet.
	#[instrument(skip_all, fields(source = %image.path.display()))]
	pub fn encode(
		&self,
		image: &ImageSource,
		study: &StudyContext,
		series: &SeriesContext,
		output_dir: &Path,
	) -> Result<EncodedObject, EncodeError> {
		let file_path = target_path(&image.path, output_dir)?;
		if file_path.exists() {
			return Err(EncodeError::ConflictError(file_path));
		}

		let attributes = SecondaryCaptureImage::new(
			study,
			series,
			self.uids.allocate(),
			series.next_instance_number(),
			image.width,
			image.height,
			image.to_rgb()?,
		)?;
		let sop_instance_uid = attributes.sop_instance_uid.clone();

		let file = InMemDicomObject::from(attributes)
			.with_meta(
				FileMetaTableBuilder::new()
					.transfer_syntax(TRANSFER_SYNTAX_UID)
					.media_storage_sop_class_uid(SOP_CLASS_UID)
					.media_storage_sop_instance_uid(sop_instance_uid.as_str())
					.implementation_class_uid(IMPLEMENTATION_CLASS_UID)
					.implementation_version_name(IMPLEMENTATION_VERSION_NAME),
			)
			.map_err(|err| EncodeError::WriteFailed(err.to_string()))?;

		let partial = tempfile::Builder::new()
			.prefix(".")
			.suffix(".partial")
			.tempfile_in(output_dir)
			.map_err(|err| EncodeError::WriteFailed(format!("{}: {err}", output_dir.display())))?;

		file.write_to_file(partial.path())
			.map_err(|err| EncodeError::WriteFailed(err.to_string()))?;

		partial.persist_noclobber(&file_path).map_err(|err| {
			if err.error.kind() == ErrorKind::AlreadyExists {
				EncodeError::ConflictError(file_path.clone())
			} else {
				EncodeError::WriteFailed(format!("{}: {}", file_path.display(), err.error))
			}
		})?;

		debug!(
			sop_instance_uid,
			file = %file_path.display(),
			"Wrote DICOM file"
		);

		Ok(EncodedObject {
			sop_instance_uid,
			sop_class_uid: UI::from(SOP_CLASS_UID),
			file_path,
			source_path: image.path.clone(),
		})
	}
}

/// `<output_dir>/<source stem>.dcm`
fn target_path(source: &Path, output_dir: &Path) -> Result<PathBuf, EncodeError> {
	let stem = source.file_stem().ok_or_else(|| {
		EncodeError::WriteFailed(format!("{} has no file name", source.display()))
	})?;
	// `with_extension` would cut stems that contain a dot
	let mut file_name = stem.to_os_string();
	file_name.push(".");
	file_name.push(DICOM_EXTENSION);
	Ok(output_dir.join(file_name))
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::dictionary_std::tags;
	use dicom::object::open_file;
	use dicom_pixeldata::PixelDecoder;

	fn captured_at() -> NaiveDateTime {
		NaiveDateTime::parse_from_str("2024-03-05 14:07:09", "%Y-%m-%d %H:%M:%S").unwrap()
	}

	fn contexts() -> (StudyContext, SeriesContext) {
		let uids = UidAllocator::default();
		(
			StudyContext::new("SILVA^MARIA", captured_at(), &uids),
			SeriesContext::new(&uids),
		)
	}

	/// A 200x100 RGB gradient so that an axis swap would be visible in the pixel values.
	fn gradient(path: &str) -> ImageSource {
		let (width, height) = (200u32, 100u32);
		let mut pixels = Vec::with_capacity((width * height * 3) as usize);
		for y in 0..height {
			for x in 0..width {
				pixels.extend_from_slice(&[x as u8, y as u8, (x + y) as u8]);
			}
		}
		ImageSource {
			path: PathBuf::from(path),
			width,
			height,
			channels: 3,
			pixels,
		}
	}

	#[test]
	fn study_context_is_derived_from_capture_time() {
		let (study, series) = contexts();
		assert_eq!(study.patient_id, "ID-20240305140709");
		assert_eq!(study.study_date, "20240305");
		assert_eq!(study.study_time, "140709");
		assert_ne!(study.study_uid, series.series_uid);
	}

	#[test]
	fn writes_part10_file() {
		let dir = tempfile::tempdir().unwrap();
		let (study, series) = contexts();
		let image = gradient("/captures/IMG_0001.JPG");

		let encoded = DatasetEncoder::default()
			.encode(&image, &study, &series, dir.path())
			.unwrap();

		assert_eq!(encoded.file_path, dir.path().join("IMG_0001.dcm"));
		assert_eq!(encoded.source_path, PathBuf::from("/captures/IMG_0001.JPG"));
		assert_eq!(encoded.sop_class_uid, SOP_CLASS_UID);

		let bytes = std::fs::read(&encoded.file_path).unwrap();
		assert!(bytes[..128].iter().all(|&b| b == 0));
		assert_eq!(&bytes[128..132], b"DICM");

		let object = open_file(&encoded.file_path).unwrap();
		assert_eq!(object.meta().transfer_syntax(), TRANSFER_SYNTAX_UID);
		assert_eq!(object.meta().media_storage_sop_class_uid(), SOP_CLASS_UID);
		assert_eq!(
			object.meta().media_storage_sop_instance_uid(),
			encoded.sop_instance_uid
		);

		let str_of = |tag| object.element(tag).unwrap().to_str().unwrap().to_string();
		let int_of = |tag| object.element(tag).unwrap().to_int::<u16>().unwrap();
		assert_eq!(str_of(tags::PATIENT_NAME), "SILVA^MARIA");
		assert_eq!(str_of(tags::PATIENT_ID), "ID-20240305140709");
		assert_eq!(str_of(tags::MODALITY), "OT");
		assert_eq!(str_of(tags::PHOTOMETRIC_INTERPRETATION), "RGB");
		assert_eq!(str_of(tags::STUDY_INSTANCE_UID), study.study_uid);
		assert_eq!(str_of(tags::SERIES_INSTANCE_UID), series.series_uid);
		assert_eq!(str_of(tags::SOP_INSTANCE_UID), encoded.sop_instance_uid);
		assert_ne!(encoded.sop_instance_uid, study.study_uid);
		assert_ne!(encoded.sop_instance_uid, series.series_uid);
		assert_eq!(int_of(tags::COLUMNS), 200);
		assert_eq!(int_of(tags::ROWS), 100);
		assert_eq!(int_of(tags::BITS_ALLOCATED), 8);
		assert_eq!(int_of(tags::BITS_STORED), 8);
		assert_eq!(int_of(tags::PIXEL_REPRESENTATION), 0);

		let pixels = object
			.element(tags::PIXEL_DATA)
			.unwrap()
			.to_bytes()
			.unwrap();
		assert_eq!(pixels.as_ref(), image.pixels.as_slice());
	}

	#[test]
	fn pixel_data_round_trips_through_decoder() {
		let dir = tempfile::tempdir().unwrap();
		let (study, series) = contexts();
		let image = gradient("gradient.png");

		let encoded = DatasetEncoder::default()
			.encode(&image, &study, &series, dir.path())
			.unwrap();

		let object = open_file(&encoded.file_path).unwrap();
		let decoded = object.decode_pixel_data().unwrap();
		assert_eq!(decoded.columns(), 200);
		assert_eq!(decoded.rows(), 100);
		assert_eq!(decoded.samples_per_pixel(), 3);
		assert_eq!(decoded.data(), image.pixels.as_slice());
	}

	#[test]
	fn shares_study_and_series_uids_across_batch() {
		let dir = tempfile::tempdir().unwrap();
		let (study, series) = contexts();
		let encoder = DatasetEncoder::default();

		let objects: Vec<_> = (0..5)
			.map(|i| {
				encoder
					.encode(&gradient(&format!("{i}.png")), &study, &series, dir.path())
					.unwrap()
			})
			.collect();

		let instance_numbers: Vec<_> = objects
			.iter()
			.map(|o| {
				open_file(&o.file_path)
					.unwrap()
					.element(tags::INSTANCE_NUMBER)
					.unwrap()
					.to_int::<u32>()
					.unwrap()
			})
			.collect();
		assert_eq!(instance_numbers, vec![1, 2, 3, 4, 5]);

		let mut sop_uids: Vec<_> = objects.iter().map(|o| &o.sop_instance_uid).collect();
		sop_uids.sort();
		sop_uids.dedup();
		assert_eq!(sop_uids.len(), objects.len());

		for encoded in &objects {
			let object = open_file(&encoded.file_path).unwrap();
			let uid = |tag| object.element(tag).unwrap().to_str().unwrap().to_string();
			assert_eq!(uid(tags::STUDY_INSTANCE_UID), study.study_uid);
			assert_eq!(uid(tags::SERIES_INSTANCE_UID), series.series_uid);
		}
	}

	#[test]
	fn refuses_to_overwrite_existing_file() {
		let dir = tempfile::tempdir().unwrap();
		let (study, series) = contexts();
		let existing = dir.path().join("scan.dcm");
		std::fs::write(&existing, b"keep me").unwrap();

		let result = DatasetEncoder::default().encode(
			&gradient("scan.jpg"),
			&study,
			&series,
			dir.path(),
		);

		assert!(matches!(result, Err(EncodeError::ConflictError(path)) if path == existing));
		assert_eq!(std::fs::read(&existing).unwrap(), b"keep me");
	}

	#[test]
	fn leaves_no_partial_file_on_failure() {
		let dir = tempfile::tempdir().unwrap();
		let (study, series) = contexts();
		let mut image = gradient("bad.png");
		image.channels = 7;

		let result = DatasetEncoder::default().encode(&image, &study, &series, dir.path());

		assert!(matches!(result, Err(EncodeError::DecodeFailed(_))));
		assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
	}

	#[test]
	fn keeps_dots_in_file_stem() {
		let dir = tempfile::tempdir().unwrap();
		let (study, series) = contexts();

		let encoded = DatasetEncoder::default()
			.encode(&gradient("scan.v2.png"), &study, &series, dir.path())
			.unwrap();

		assert_eq!(encoded.file_path, dir.path().join("scan.v2.dcm"));
	}

	#[test]
	fn missing_output_dir_fails_to_write() {
		let dir = tempfile::tempdir().unwrap();
		let (study, series) = contexts();

		let result = DatasetEncoder::default().encode(
			&gradient("a.png"),
			&study,
			&series,
			&dir.path().join("missing"),
		);

		assert!(matches!(result, Err(EncodeError::WriteFailed(_))));
	}
}

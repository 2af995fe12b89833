use super::{EncodeError, SeriesContext, StudyContext};
use crate::types::{UI, US};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

/// SOP class of every object produced by the encoder.
pub const SOP_CLASS_UID: &str = uids::SECONDARY_CAPTURE_IMAGE_STORAGE;

/// Unicode in UTF-8, patient names are arbitrary text.
const SPECIFIC_CHARACTER_SET: &str = "ISO_IR 192";
/// Other.
const MODALITY: &str = "OT";
/// Workstation.
const CONVERSION_TYPE: &str = "WSD";
/// Every batch forms a single series.
const SERIES_NUMBER: &str = "1";

/// The fixed attribute set of a single-frame 8-bit RGB Secondary Capture image.
///
/// All values are checked in [`SecondaryCaptureImage::new`], so conversion into a data set
/// cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryCaptureImage {
	pub patient_name: String,
	pub patient_id: String,
	pub study_date: String,
	pub study_time: String,
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
	pub instance_number: u32,
	pub rows: US,
	pub columns: US,
	/// Interleaved RGB samples, `rows * columns * 3` bytes.
	pub pixel_data: Vec<u8>,
}

impl SecondaryCaptureImage {
	pub fn new(
		study: &StudyContext,
		series: &SeriesContext,
		sop_instance_uid: UI,
		instance_number: u32,
		width: u32,
		height: u32,
		pixel_data: Vec<u8>,
	) -> Result<Self, EncodeError> {
		let dimension = |value: u32, name: &str| {
			US::try_from(value)
				.ok()
				.filter(|&value| value > 0)
				.ok_or_else(|| {
					EncodeError::DecodeFailed(format!("{name} {value} is outside 1..=65535"))
				})
		};
		// Columns follow the image width, rows follow the image height.
		let columns = dimension(width, "width")?;
		let rows = dimension(height, "height")?;

		let expected = usize::from(rows) * usize::from(columns) * 3;
		if pixel_data.len() != expected {
			return Err(EncodeError::DecodeFailed(format!(
				"expected {expected} RGB bytes, got {}",
				pixel_data.len()
			)));
		}

		if sop_instance_uid == study.study_uid || sop_instance_uid == series.series_uid {
			return Err(EncodeError::DecodeFailed(String::from(
				"SOP instance UID must differ from study and series UIDs",
			)));
		}

		Ok(Self {
			patient_name: study.patient_name.clone(),
			patient_id: study.patient_id.clone(),
			study_date: study.study_date.clone(),
			study_time: study.study_time.clone(),
			study_instance_uid: study.study_uid.clone(),
			series_instance_uid: series.series_uid.clone(),
			sop_instance_uid,
			instance_number,
			rows,
			columns,
			pixel_data,
		})
	}
}

impl From<SecondaryCaptureImage> for InMemDicomObject {
	#[rustfmt::skip]
	fn from(image: SecondaryCaptureImage) -> Self {
		let mut pixel_data = image.pixel_data;
		// OB values must have an even length.
		if pixel_data.len() % 2 == 1 {
			pixel_data.push(0);
		}

		Self::from_element_iter([
			DataElement::new(tags::SPECIFIC_CHARACTER_SET, VR::CS, dicom_value!(Str, SPECIFIC_CHARACTER_SET)),
			DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, SOP_CLASS_UID)),
			DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, image.sop_instance_uid)),
			DataElement::new(tags::STUDY_DATE, VR::DA, dicom_value!(Str, image.study_date)),
			DataElement::new(tags::STUDY_TIME, VR::TM, dicom_value!(Str, image.study_time)),
			DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, MODALITY)),
			DataElement::new(tags::CONVERSION_TYPE, VR::CS, dicom_value!(Str, CONVERSION_TYPE)),
			DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, image.patient_name)),
			DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, image.patient_id)),
			DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, image.study_instance_uid)),
			DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, image.series_instance_uid)),
			DataElement::new(tags::SERIES_NUMBER, VR::IS, dicom_value!(Str, SERIES_NUMBER)),
			DataElement::new(tags::INSTANCE_NUMBER, VR::IS, dicom_value!(Str, image.instance_number.to_string())),
			DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, dicom_value!(U16, [3])),
			DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, dicom_value!(Str, "RGB")),
			DataElement::new(tags::PLANAR_CONFIGURATION, VR::US, dicom_value!(U16, [0])),
			DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [image.rows])),
			DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [image.columns])),
			DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [8])),
			DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [8])),
			DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [7])),
			DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, dicom_value!(U16, [0])),
			DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(pixel_data)),
		])
	}
}

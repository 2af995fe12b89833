use super::EncodeError;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use tracing::trace;

/// A decoded raster image with 8-bit samples in row-major interleaved order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
	pub path: PathBuf,
	pub width: u32,
	pub height: u32,
	pub channels: u8,
	pub pixels: Vec<u8>,
}

impl ImageSource {
	/// Decodes the raster image at `path`.
	///
	/// 8-bit grey, grey+alpha, RGB and RGBA images keep their native layout.
	/// Images with other sample depths are converted to 8-bit RGB.
	pub fn open(path: &Path) -> Result<Self, EncodeError> {
		let image = image::open(path).map_err(|err| {
			EncodeError::DecodeFailed(format!("{}: {err}", path.display()))
		})?;
		Ok(Self::from_dynamic(path, image))
	}

	fn from_dynamic(path: &Path, image: DynamicImage) -> Self {
		let (width, height) = (image.width(), image.height());
		let image = match image {
			DynamicImage::ImageLuma8(_)
			| DynamicImage::ImageLumaA8(_)
			| DynamicImage::ImageRgb8(_)
			| DynamicImage::ImageRgba8(_) => image,
			other => {
				trace!(color = ?other.color(), "Converting image to 8-bit RGB");
				DynamicImage::ImageRgb8(other.to_rgb8())
			}
		};
		let channels = image.color().channel_count();

		Self {
			path: path.to_path_buf(),
			width,
			height,
			channels,
			pixels: image.into_bytes(),
		}
	}

	/// Returns the pixels as interleaved RGB triplets.
	///
	/// Grey samples are replicated into all three channels and alpha is dropped.
	/// Any other layout, or a buffer whose size does not match the dimensions, is rejected.
	pub fn to_rgb(&self) -> Result<Vec<u8>, EncodeError> {
		let expected = self.width as usize * self.height as usize * usize::from(self.channels);
		if self.pixels.len() != expected {
			return Err(EncodeError::DecodeFailed(format!(
				"{}: expected {expected} bytes for {}x{}x{}, got {}",
				self.path.display(),
				self.width,
				self.height,
				self.channels,
				self.pixels.len()
			)));
		}

		let rgb = match self.channels {
			3 => self.pixels.clone(),
			1 => self.pixels.iter().flat_map(|&v| [v, v, v]).collect(),
			2 => self
				.pixels
				.chunks_exact(2)
				.flat_map(|la| [la[0], la[0], la[0]])
				.collect(),
			4 => self
				.pixels
				.chunks_exact(4)
				.flat_map(|rgba| [rgba[0], rgba[1], rgba[2]])
				.collect(),
			channels => {
				return Err(EncodeError::DecodeFailed(format!(
					"{}: unsupported channel count {channels}",
					self.path.display()
				)))
			}
		};
		Ok(rgb)
	}
}

use crate::types::UI;
use uuid::Uuid;

/// Root under which all UIDs generated by this application are allocated.
pub const UID_ROOT: &str = "1.2.826.0.1.3680043.2.1125";

/// Maximum length of a UI value, see PS3.5 Table 6.2-1.
const UID_MAX_LENGTH: usize = 64;

/// Allocates DICOM unique identifiers of the form `<root>.<suffix>`.
///
/// The suffix is a random 128-bit value (UUID v4) printed as a decimal integer and reduced
/// so that the complete identifier never exceeds 64 characters. Uniqueness relies on the
/// entropy of the random value alone, so allocators need no shared state.
#[derive(Debug, Clone, Copy)]
pub struct UidAllocator {
	root: &'static str,
	modulus: u128,
}

impl Default for UidAllocator {
	fn default() -> Self {
		Self::new(UID_ROOT)
	}
}

impl UidAllocator {
	const fn new(root: &'static str) -> Self {
		// One character is taken by the separating dot.
		let digits = UID_MAX_LENGTH - root.len() - 1;
		// u128::MAX has 39 decimal digits.
		let modulus = if digits >= 39 {
			u128::MAX
		} else {
			10u128.pow(digits as u32)
		};
		Self { root, modulus }
	}

	pub fn allocate(&self) -> UI {
		let suffix = Uuid::new_v4().as_u128() % self.modulus;
		format!("{}.{suffix}", self.root)
	}
}

use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// MEDIUM priority (0000,0700), used for every request.
pub const PRIORITY_MEDIUM: US = 0x0000;

/// Maximum length of an AE title, see PS3.5 Table 6.2-1.
const AE_MAX_LENGTH: usize = 16;

/// An application entity title that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AeTitle(AE);

impl AeTitle {
	pub fn new(value: &str) -> Result<Self, InvalidAeTitle> {
		let trimmed = value.trim();
		if trimmed.is_empty() || trimmed.len() > AE_MAX_LENGTH {
			return Err(InvalidAeTitle(value.to_owned()));
		}
		if trimmed.chars().any(|c| c == '\\' || c.is_control()) {
			return Err(InvalidAeTitle(value.to_owned()));
		}
		Ok(Self(AE::from(trimmed)))
	}

	#[cfg(test)]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Display for AeTitle {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid AE title '{0}': must be 1-16 characters without backslash or control characters")]
pub struct InvalidAeTitle(pub String);

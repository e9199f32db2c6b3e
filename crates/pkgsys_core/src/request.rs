//! Resolution request parsing.

use std::fmt;
use std::str::FromStr;

use pkgsys_manifest::{is_valid_name, is_valid_version};

use crate::ResolveError;

/// A request to resolve one unit from one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionRequest {
    pub provider: String,
    pub unit: String,
    /// Pinned version. `None` resolves the latest release.
    pub version: Option<String>,
}

impl ResolutionRequest {
    pub fn new(
        provider: impl Into<String>,
        unit: impl Into<String>,
        version: Option<String>,
    ) -> Result<Self, ResolveError> {
        let request = Self {
            provider: provider.into(),
            unit: unit.into(),
            version,
        };
        request.validate()?;
        Ok(request)
    }

    /// Parse `provider.unit` or `provider.unit@version`.
    pub fn parse(s: &str) -> Result<Self, ResolveError> {
        let invalid = |reason: &str| ResolveError::invalid_request(s, reason);

        let (name_part, version) = match s.split_once('@') {
            None => (s, None),
            Some((name, v)) => {
                let v = v.trim();
                if v.is_empty() {
                    return Err(invalid("version after '@' is empty"));
                }
                (name, Some(v.to_string()))
            }
        };

        let parts: Vec<&str> = name_part.split('.').collect();
        if parts.len() != 2 {
            return Err(invalid("expected exactly two dot-separated names"));
        }

        Self::new(parts[0].trim(), parts[1].trim(), version)
    }

    fn validate(&self) -> Result<(), ResolveError> {
        let invalid = |reason: String| ResolveError::invalid_request(self.to_string(), reason);

        if !is_valid_name(&self.provider) {
            return Err(invalid(format!("invalid provider name {:?}", self.provider)));
        }
        if !is_valid_name(&self.unit) {
            return Err(invalid(format!("invalid unit name {:?}", self.unit)));
        }
        if let Some(version) = &self.version
            && !is_valid_version(version)
        {
            return Err(invalid(format!("invalid version {version:?}")));
        }
        Ok(())
    }

    /// Display name without the version.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.provider, self.unit)
    }
}

impl FromStr for ResolutionRequest {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ResolutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.provider, self.unit)?;
        if let Some(version) = &self.version {
            write!(f, "@{version}")?;
        }
        Ok(())
    }
}

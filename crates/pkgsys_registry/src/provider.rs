//! Provider descriptors.

use std::collections::BTreeSet;
use std::fmt;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use url::Url;

/// How much a provider is trusted. Enterprise providers get policy checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Low,
    High,
    Enterprise,
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::High => "high",
            Self::Enterprise => "enterprise",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFlag {
    /// Publishing requires a second factor. Carried for the host; not checked here.
    RequireSecondFactor,
    /// Permit base locations on loopback and private networks.
    AllowLocal,
}

/// Per-provider policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderPolicy {
    pub flags: BTreeSet<PolicyFlag>,
    /// Lowest acceptable unit version. Enforced for Enterprise providers.
    pub min_version: Option<semver::Version>,
}

impl ProviderPolicy {
    pub fn with_flag(mut self, flag: PolicyFlag) -> Self {
        self.flags.insert(flag);
        self
    }

    pub fn with_min_version(mut self, version: semver::Version) -> Self {
        self.min_version = Some(version);
        self
    }

    pub fn has(&self, flag: PolicyFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn allow_local(&self) -> bool {
        self.has(PolicyFlag::AllowLocal)
    }
}

/// A named, keyed source of units. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub name: String,
    pub base_location: Url,
    pub public_key: VerifyingKey,
    pub trust_tier: TrustTier,
    pub policy: ProviderPolicy,
}

impl ProviderDescriptor {
    pub fn new(
        name: impl Into<String>,
        base_location: Url,
        public_key: VerifyingKey,
        trust_tier: TrustTier,
        policy: ProviderPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            base_location,
            public_key,
            trust_tier,
            policy,
        }
    }

    /// Hex fingerprint of the public key, for logs.
    pub fn key_fingerprint(&self) -> String {
        let bytes = self.public_key.as_bytes();
        bytes[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

//! Built-in platform policies
//!
//! Each module holds the typed providerSpec for its platform plus the
//! defaulting and validation rules. Unknown fields are carried through
//! untouched so defaulting never drops configuration this crate does not
//! model.

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod nutanix;
pub mod powervs;
pub mod vsphere;

/// Instance architecture of the running webhook, used for defaults
pub(crate) fn is_arm64() -> bool {
    std::env::consts::ARCH == "aarch64"
}

/// `providerSpec.<path>` field name
pub(crate) fn field(path: &str) -> String {
    format!("{}.{path}", crate::policy::PROVIDER_SPEC)
}

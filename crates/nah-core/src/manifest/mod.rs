//! Typed manifest model (§4.D): NAP, NAK, host, and install-record
//! documents, each parsed through a dedicated structure with an
//! explicit schema-version check.

pub mod env_value;
pub mod host;
pub mod nak;
pub mod nap;
pub mod record;

pub use env_value::{EnvOp, EnvOperation, EnvValue};
pub use host::HostManifest;
pub use nak::{NakManifest, NakSection};
pub use nap::{ManifestWarning, NapManifest, ParsedNap};
pub use record::{AppInstallRecord, NakInstallRecord, Provenance, Trust, TrustState};

pub const NAK_COMPOSE_SCHEMA: &str = "nak.compose.v1";

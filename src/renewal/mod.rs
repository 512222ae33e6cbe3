//! Automated certificate renewal.
//!
//! - [`issuer`]: the external issuance capability and its webhook client
//! - [`writer`]: atomic key/chain writes into a site's certificate directory
//! - [`scheduler`]: the periodic per-site renewal state machine with retry/backoff

pub mod issuer;
pub mod scheduler;
pub mod writer;

pub use issuer::{IssuanceError, IssuedCertificate, Issuer, WebhookIssuer};
pub use scheduler::{RenewalPolicy, RenewalScheduler, RenewalState, RenewalStatus, SchedulerHandle};
pub use writer::{write_certificate, CertWriteError};

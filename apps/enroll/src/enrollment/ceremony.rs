use async_trait::async_trait;

use super::{CreationOptions, EnrollmentError, RegisteredCredential};

/// Platform step that turns decoded creation options into a new credential.
///
/// Runs to completion once started; the pairing session neither times it out
/// nor cancels it.
#[async_trait]
pub trait CredentialCeremony: Send + Sync {
    fn is_supported(&self) -> bool {
        true
    }

    async fn create(
        &self,
        options: CreationOptions,
    ) -> Result<RegisteredCredential, EnrollmentError>;
}

//! Secret store and cipher ports.

use runloom_types::error::{SecretError, StoreError};
use runloom_types::secret::SecretRecord;

/// Storage port for secret rows. Values come back in their at-rest form;
/// decryption is the cipher's job.
pub trait SecretStore: Send + Sync {
    fn find_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<SecretRecord>, StoreError>> + Send;

    /// Existing records among `names`, in no particular order. Missing
    /// names are simply absent from the result.
    fn find_many_by_names(
        &self,
        names: &[String],
    ) -> impl Future<Output = Result<Vec<SecretRecord>, StoreError>> + Send;
}

/// At-rest encryption for secret values.
///
/// `decrypt` must pass through values without the ciphertext prefix
/// unchanged, so rows predating encryption keep working. Implementations
/// must never surface key or plaintext material in errors.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError>;

    fn decrypt(&self, value: &str) -> Result<String, SecretError>;
}

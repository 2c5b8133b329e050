use anyhow::Result;

/// Opaque credential encryption. Values handed to the rest of the crate are
/// ciphertexts until a consumer decrypts them right before use.
pub trait SecretStore: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Stores secrets as given. Development setups only.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSecretStore;

impl SecretStore for PassthroughSecretStore {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

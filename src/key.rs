//! Persistent Ed25519 key material: the server's own identity key, and
//! (via the same helper) the CA signing keys in `ca::authority`.

use log::info;
use russh_keys::HashAlg;

/// Path to store the server's own SSH identity key (distinct from the
/// host/user CA keys, which sign certificates rather than identifying
/// this process on the wire).
const SERVER_KEY_PATH: &str = "server_key.pem";

/// Load server key from file, or generate a new one and save it.
pub fn load_or_generate_server_key() -> anyhow::Result<russh_keys::PrivateKey> {
    load_or_generate_key_at(SERVER_KEY_PATH)
}

/// Load an Ed25519 private key from `path`, or generate and persist a new
/// one. Shared by the server identity key and both CA keys.
pub fn load_or_generate_key_at(path: &str) -> anyhow::Result<russh_keys::PrivateKey> {
    use russh_keys::Algorithm;
    use std::fs;
    use std::path::Path;

    let key_path = Path::new(path);

    if key_path.exists() {
        info!("Loading key from {}...", path);
        let key_data = fs::read_to_string(key_path)?;
        let key = russh_keys::PrivateKey::from_openssh(&key_data)?;
        info!("Key fingerprint: {}", key.public_key().fingerprint(HashAlg::Sha256));
        Ok(key)
    } else {
        info!("Generating new Ed25519 key at {}...", path);
        let key = russh_keys::PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;

        let key_data = key.to_openssh(russh_keys::ssh_key::LineEnding::LF)?;
        fs::write(key_path, key_data.as_bytes())?;
        info!("Key saved to {}", path);
        info!("Key fingerprint: {}", key.public_key().fingerprint(HashAlg::Sha256));

        Ok(key)
    }
}

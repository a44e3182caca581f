//! HMAC-SHA256 challenge/response mechanism over a pre-shared key.
//!
//! Exchange: the client's initial response names the user; the server
//! challenges with a random nonce; the client answers
//! `hex(HMAC-SHA256(secret, nonce || username))`; the server verifies in
//! constant time and completes with the username as authorization id.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};

use super::{ClientMechanism, MechanismProvider, ServerMechanism, ServerStep};

pub(crate) const MECHANISM: &str = "HMAC-SHA256";

const NONCE_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

fn sign(secret: &str, nonce: &[u8], username: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(nonce);
    mac.update(username.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify(secret: &str, nonce: &[u8], username: &str, signature: &[u8]) -> bool {
    let expected = sign(secret, nonce, username);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature).into()
}

/// Provider for the HMAC-SHA256 mechanism.
///
/// Both sides are constructed with the shared secret; the client side also
/// carries the username it authenticates as.
#[derive(Clone)]
pub struct HmacSha256Mechanism {
    username: String,
    secret: String,
}

impl HmacSha256Mechanism {
    /// Create a provider for `username` with the given pre-shared secret.
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for HmacSha256Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // secret deliberately omitted
        f.debug_struct("HmacSha256Mechanism")
            .field("username", &self.username)
            .finish()
    }
}

impl MechanismProvider for HmacSha256Mechanism {
    fn mechanism(&self) -> &str {
        MECHANISM
    }

    fn create_client(&self) -> Result<Box<dyn ClientMechanism>> {
        Ok(Box::new(HmacClient {
            username: self.username.clone(),
            secret: self.secret.clone(),
        }))
    }

    fn create_server(&self) -> Result<Box<dyn ServerMechanism>> {
        Ok(Box::new(HmacServer {
            secret: self.secret.clone(),
            state: ServerState::AwaitingUsername,
        }))
    }
}

struct HmacClient {
    username: String,
    secret: String,
}

impl ClientMechanism for HmacClient {
    fn mechanism(&self) -> &str {
        MECHANISM
    }

    fn initial_response(&mut self) -> Result<Vec<u8>> {
        Ok(self.username.as_bytes().to_vec())
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        if challenge.len() != NONCE_LEN {
            return Err(Error::Authentication(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                challenge.len()
            )));
        }
        Ok(sign(&self.secret, challenge, &self.username).into_bytes())
    }

    fn authorization_id(&self) -> String {
        self.username.clone()
    }
}

enum ServerState {
    AwaitingUsername,
    AwaitingSignature { username: String, nonce: Vec<u8> },
}

struct HmacServer {
    secret: String,
    state: ServerState,
}

impl ServerMechanism for HmacServer {
    fn mechanism(&self) -> &str {
        MECHANISM
    }

    fn evaluate_response(&mut self, response: &[u8]) -> Result<ServerStep> {
        match std::mem::replace(&mut self.state, ServerState::AwaitingUsername) {
            ServerState::AwaitingUsername => {
                let username = match std::str::from_utf8(response) {
                    Ok(name) if !name.is_empty() => name.to_string(),
                    _ => return Ok(ServerStep::Failed("invalid username".into())),
                };
                let mut nonce = vec![0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                self.state = ServerState::AwaitingSignature {
                    username,
                    nonce: nonce.clone(),
                };
                Ok(ServerStep::Challenge(nonce))
            }
            ServerState::AwaitingSignature { username, nonce } => {
                if verify(&self.secret, &nonce, &username, response) {
                    Ok(ServerStep::Complete {
                        authorization_id: username,
                        final_data: Vec::new(),
                    })
                } else {
                    Ok(ServerStep::Failed("signature mismatch".into()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_exchange(client_secret: &str, server_secret: &str) -> ServerStep {
        let client_provider = HmacSha256Mechanism::new("alice", client_secret);
        let server_provider = HmacSha256Mechanism::new("unused", server_secret);
        let mut client = client_provider.create_client().unwrap();
        let mut server = server_provider.create_server().unwrap();

        let initial = client.initial_response().unwrap();
        let challenge = match server.evaluate_response(&initial).unwrap() {
            ServerStep::Challenge(nonce) => nonce,
            other => panic!("expected challenge, got {other:?}"),
        };
        let signature = client.evaluate_challenge(&challenge).unwrap();
        server.evaluate_response(&signature).unwrap()
    }

    #[test]
    fn test_matching_secret_completes() {
        match run_exchange("s3cret", "s3cret") {
            ServerStep::Complete {
                authorization_id, ..
            } => assert_eq!(authorization_id, "alice"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_secret_fails() {
        assert!(matches!(
            run_exchange("s3cret", "different"),
            ServerStep::Failed(_)
        ));
    }

    #[test]
    fn test_empty_username_fails() {
        let provider = HmacSha256Mechanism::new("", "s3cret");
        let mut server = provider.create_server().unwrap();
        assert!(matches!(
            server.evaluate_response(b"").unwrap(),
            ServerStep::Failed(_)
        ));
    }

    #[test]
    fn test_client_rejects_short_nonce() {
        let provider = HmacSha256Mechanism::new("alice", "s3cret");
        let mut client = provider.create_client().unwrap();
        client.initial_response().unwrap();
        assert!(client.evaluate_challenge(b"short").is_err());
    }

    #[test]
    fn test_nonces_are_unique() {
        let provider = HmacSha256Mechanism::new("alice", "s3cret");
        let mut a = provider.create_server().unwrap();
        let mut b = provider.create_server().unwrap();
        let nonce_a = match a.evaluate_response(b"alice").unwrap() {
            ServerStep::Challenge(n) => n,
            other => panic!("{other:?}"),
        };
        let nonce_b = match b.evaluate_response(b"alice").unwrap() {
            ServerStep::Challenge(n) => n,
            other => panic!("{other:?}"),
        };
        assert_ne!(nonce_a, nonce_b);
    }
}

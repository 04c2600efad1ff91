//! SCRAM-SHA-256 SASL mechanism.
//!
//! Implements both sides of SCRAM-SHA-256 per:
//! - RFC 5802: Salted Challenge Response Authentication Mechanism (SCRAM)
//! - RFC 7677: SCRAM-SHA-256 and SCRAM-SHA-256-PLUS
//!
//! Channel binding (the -PLUS variant) is not offered.
//!
//! ## Protocol Flow
//!
//! 1. Client sends client-first-message: `n,,n=user,r=clientnonce`
//! 2. Server sends server-first-message: `r=clientnonce+servernonce,s=salt,i=iterations`
//! 3. Client sends client-final-message: `c=channel,r=nonce,p=clientproof`
//! 4. Server verifies and sends server-final-message: `v=serversignature`

use std::fmt;
use std::sync::Arc;

use base64::prelude::*;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Authenticator, ClientMechanism, Credentials, ServerMechanism, ServerStep};
use crate::error::SaslCondition;
use crate::packet::{Packet, SaslAuth, SaslPayload};
use crate::XmppError;

pub const MECHANISM: &str = "SCRAM-SHA-256";

/// Default number of PBKDF2 iterations.
/// RFC 7677 recommends at least 4096.
pub const DEFAULT_ITERATIONS: u32 = 4096;

/// Length of generated nonce in bytes (will be base64 encoded).
const NONCE_LENGTH: usize = 24;

/// What the server stores per user instead of the password.
#[derive(Clone, PartialEq, Eq)]
pub struct ScramCredentials {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl ScramCredentials {
    /// Derive the stored keys for `password`.
    pub fn derive(password: &str, salt: Vec<u8>, iterations: u32) -> Self {
        let (stored_key, server_key) = generate_scram_keys(password, &salt, iterations);
        Self {
            salt,
            iterations,
            stored_key,
            server_key,
        }
    }
}

impl fmt::Debug for ScramCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramCredentials")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

/// Server side of SCRAM-SHA-256.
pub struct ScramSha256Server {
    authenticator: Arc<dyn Authenticator>,
    state: ServerState,
}

enum ServerState {
    /// Waiting for client-first-message
    Initial,
    /// Sent server-first-message, waiting for client-final-message
    WaitingForClientFinal(Box<Exchange>),
    /// Exchange finished (success or failure)
    Complete,
}

/// Everything the final verification needs from the first round.
struct Exchange {
    username: String,
    gs2_header: String,
    client_first_bare: String,
    server_first: String,
    combined_nonce: String,
    /// `None` for unknown users; the exchange still runs and fails at the end
    credentials: Option<ScramCredentials>,
}

impl ScramSha256Server {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            state: ServerState::Initial,
        }
    }

    fn client_first(&mut self, data: &[u8]) -> ServerStep {
        let Ok(message) = std::str::from_utf8(data) else {
            return self.fail(SaslCondition::MalformedRequest, "client-first-message is not UTF-8");
        };
        let parsed = match parse_client_first(message) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(SaslCondition::MalformedRequest, e.to_string()),
        };

        // 'y' means the client could bind but believes we cannot, which is true.
        if parsed.gs2_cbind_flag == 'p' {
            return self.fail(SaslCondition::MalformedRequest, "channel binding not supported");
        }
        if parsed
            .authzid
            .as_ref()
            .is_some_and(|authzid| authzid != &parsed.username)
        {
            return self.fail(SaslCondition::InvalidAuthzid, "authzid not permitted");
        }

        let credentials = self.authenticator.scram_credentials(&parsed.username);
        if credentials.is_none() {
            debug!(username = %parsed.username, "Unknown SCRAM user");
        }

        // Unknown users get a throwaway salt so the reply looks the same.
        let (salt, iterations) = match &credentials {
            Some(credentials) => (credentials.salt.clone(), credentials.iterations),
            None => (generate_salt(), DEFAULT_ITERATIONS),
        };

        let combined_nonce = format!("{}{}", parsed.client_nonce, generate_nonce());
        let server_first = format!(
            "r={},s={},i={}",
            combined_nonce,
            BASE64_STANDARD.encode(&salt),
            iterations
        );

        let step = ServerStep::challenge(server_first.as_bytes());
        self.state = ServerState::WaitingForClientFinal(Box::new(Exchange {
            username: parsed.username,
            gs2_header: parsed.gs2_header,
            client_first_bare: parsed.bare,
            server_first,
            combined_nonce,
            credentials,
        }));
        step
    }

    fn client_final(&mut self, exchange: Exchange, data: &[u8]) -> ServerStep {
        let Ok(message) = std::str::from_utf8(data) else {
            return self.fail(SaslCondition::MalformedRequest, "client-final-message is not UTF-8");
        };
        let parsed = match parse_client_final(message) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(SaslCondition::MalformedRequest, e.to_string()),
        };

        if parsed.nonce != exchange.combined_nonce {
            return self.fail(SaslCondition::NotAuthorized, "nonce mismatch");
        }
        if parsed.channel_binding != BASE64_STANDARD.encode(&exchange.gs2_header) {
            return self.fail(SaslCondition::NotAuthorized, "channel binding mismatch");
        }

        let Some(credentials) = exchange.credentials else {
            return self.fail(SaslCondition::NotAuthorized, "authentication failed");
        };

        // AuthMessage = client-first-message-bare + "," + server-first-message + "," + client-final-message-without-proof
        let auth_message = format!(
            "{},{},{}",
            exchange.client_first_bare, exchange.server_first, parsed.without_proof
        );

        match verify_proof(&credentials, &auth_message, &parsed.proof) {
            Ok(Some(server_signature)) => {
                self.state = ServerState::Complete;
                let server_final = format!("v={}", BASE64_STANDARD.encode(server_signature));
                ServerStep::success(exchange.username, server_final.as_bytes())
            }
            Ok(None) => self.fail(SaslCondition::NotAuthorized, "authentication failed"),
            Err(e) => self.fail(SaslCondition::TemporaryAuthFailure, e.to_string()),
        }
    }

    fn fail(&mut self, condition: SaslCondition, text: impl Into<String>) -> ServerStep {
        self.state = ServerState::Complete;
        ServerStep::failure(condition, text)
    }
}

impl ServerMechanism for ScramSha256Server {
    fn auth(&mut self, initial: &[u8]) -> ServerStep {
        if !matches!(self.state, ServerState::Initial) {
            return self.fail(SaslCondition::MalformedRequest, "invalid SCRAM state for client-first");
        }
        // SCRAM is client-first; an empty initial response is an empty message.
        self.client_first(initial)
    }

    fn response(&mut self, data: &[u8]) -> ServerStep {
        match std::mem::replace(&mut self.state, ServerState::Complete) {
            ServerState::WaitingForClientFinal(exchange) => self.client_final(*exchange, data),
            _ => self.fail(SaslCondition::MalformedRequest, "invalid SCRAM state for client-final"),
        }
    }
}

/// Check a client proof. Returns the server signature when it is valid.
fn verify_proof(
    credentials: &ScramCredentials,
    auth_message: &str,
    proof_b64: &str,
) -> Result<Option<Vec<u8>>, XmppError> {
    // ClientSignature = HMAC(StoredKey, AuthMessage)
    let client_signature = hmac_sha256(&credentials.stored_key, auth_message.as_bytes())?;

    let Ok(client_proof) = BASE64_STANDARD.decode(proof_b64) else {
        return Ok(None);
    };
    if client_proof.len() != client_signature.len() {
        return Ok(None);
    }

    // ClientKey = ClientProof XOR ClientSignature
    let client_key: Vec<u8> = client_proof
        .iter()
        .zip(client_signature.iter())
        .map(|(a, b)| a ^ b)
        .collect();

    // Verify: H(ClientKey) == StoredKey
    if !constant_time_eq(&sha256(&client_key), &credentials.stored_key) {
        return Ok(None);
    }

    // ServerSignature = HMAC(ServerKey, AuthMessage)
    hmac_sha256(&credentials.server_key, auth_message.as_bytes()).map(Some)
}

/// Client side of SCRAM-SHA-256.
pub struct ScramSha256Client {
    credentials: Credentials,
    state: ClientState,
}

enum ClientState {
    Initial,
    SentClientFirst {
        gs2_header: String,
        client_first_bare: String,
        client_nonce: String,
    },
    SentClientFinal {
        server_signature: Vec<u8>,
    },
    Verified,
}

impl ScramSha256Client {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: ClientState::Initial,
        }
    }

    fn client_final(
        &self,
        gs2_header: &str,
        client_first_bare: &str,
        client_nonce: &str,
        server_first: &str,
    ) -> Result<(String, Vec<u8>), XmppError> {
        let parsed = parse_server_first(server_first)?;
        if !parsed.nonce.starts_with(client_nonce) || parsed.nonce.len() == client_nonce.len() {
            return Err(XmppError::auth_failed("server nonce does not extend ours"));
        }

        // SaltedPassword = Hi(Normalize(password), salt, i)
        let salted_password = hi(
            self.credentials.password.as_bytes(),
            &parsed.salt,
            parsed.iterations,
        );
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);
        let server_key = hmac_sha256(&salted_password, b"Server Key")?;

        let without_proof = format!(
            "c={},r={}",
            BASE64_STANDARD.encode(gs2_header),
            parsed.nonce
        );
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes())?;

        let client_final = format!(
            "{},p={}",
            without_proof,
            BASE64_STANDARD.encode(client_proof)
        );
        Ok((client_final, server_signature))
    }

    fn verify_server_final(&mut self, data: &[u8]) -> Result<(), XmppError> {
        let ClientState::SentClientFinal { server_signature } = &self.state else {
            return Err(XmppError::auth_failed("unexpected server-final-message"));
        };

        let message = std::str::from_utf8(data)
            .map_err(|_| XmppError::auth_failed("server-final-message is not UTF-8"))?;
        if let Some(error) = message.strip_prefix("e=") {
            return Err(XmppError::auth_failed(format!("server reported {error}")));
        }
        let verifier = message
            .strip_prefix("v=")
            .ok_or_else(|| XmppError::auth_failed("server-final-message has no verifier"))?;
        let verifier = BASE64_STANDARD
            .decode(verifier)
            .map_err(|e| XmppError::auth_failed(format!("Invalid server signature base64: {}", e)))?;

        if &verifier != server_signature {
            return Err(XmppError::auth_failed("server signature mismatch"));
        }
        self.state = ClientState::Verified;
        Ok(())
    }
}

impl ClientMechanism for ScramSha256Client {
    fn begin(&mut self) -> Result<Packet, XmppError> {
        let gs2_header = match &self.credentials.authzid {
            Some(authzid) => format!("n,a={},", encode_sasl_name(authzid)),
            None => "n,,".to_string(),
        };
        let client_nonce = generate_nonce();
        let client_first_bare = format!(
            "n={},r={}",
            encode_sasl_name(&self.credentials.username),
            client_nonce
        );
        let message = format!("{gs2_header}{client_first_bare}");

        self.state = ClientState::SentClientFirst {
            gs2_header,
            client_first_bare,
            client_nonce,
        };
        Ok(Packet::SaslAuth(SaslAuth {
            mechanism: MECHANISM.to_string(),
            payload: SaslPayload::from_bytes(message.as_bytes()),
        }))
    }

    fn challenge(&mut self, data: &[u8]) -> Result<Packet, XmppError> {
        match &self.state {
            ClientState::SentClientFirst {
                gs2_header,
                client_first_bare,
                client_nonce,
            } => {
                let server_first = std::str::from_utf8(data)
                    .map_err(|_| XmppError::auth_failed("server-first-message is not UTF-8"))?;
                let (client_final, server_signature) =
                    self.client_final(gs2_header, client_first_bare, client_nonce, server_first)?;
                self.state = ClientState::SentClientFinal { server_signature };
                Ok(Packet::SaslResponse(SaslPayload::from_bytes(
                    client_final.as_bytes(),
                )))
            }
            // Some servers send the verifier as a challenge and an empty success.
            ClientState::SentClientFinal { .. } => {
                self.verify_server_final(data)?;
                Ok(Packet::SaslResponse(SaslPayload::from_bytes(&[])))
            }
            _ => Err(XmppError::auth_failed("unexpected SCRAM challenge")),
        }
    }

    fn success(&mut self, data: &[u8]) -> Result<(), XmppError> {
        if matches!(self.state, ClientState::Verified) && data.is_empty() {
            return Ok(());
        }
        self.verify_server_final(data)
    }
}

/// Generate SCRAM keys from a password and salt.
///
/// Returns `(StoredKey, ServerKey)`. The plaintext password should never be
/// stored.
pub fn generate_scram_keys(password: &str, salt: &[u8], iterations: u32) -> (Vec<u8>, Vec<u8>) {
    let salted_password = hi(password.as_bytes(), salt, iterations);

    // HMAC-SHA-256 accepts keys of any length, so these cannot fail.
    let client_key = hmac_sha256(&salted_password, b"Client Key").unwrap_or_default();
    let stored_key = sha256(&client_key);
    let server_key = hmac_sha256(&salted_password, b"Server Key").unwrap_or_default();

    (stored_key, server_key)
}

/// Generate a random salt for SCRAM.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; 16];
    rand::rng().fill(&mut salt[..]);
    salt
}

/// Generate a random nonce string.
fn generate_nonce() -> String {
    let mut nonce_bytes = vec![0u8; NONCE_LENGTH];
    rand::rng().fill(&mut nonce_bytes[..]);
    BASE64_STANDARD.encode(&nonce_bytes)
}

/// Hi() function from RFC 5802 - PBKDF2-HMAC-SHA256.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut output = vec![0u8; 32];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
    output
}

/// HMAC-SHA-256 helper.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, XmppError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| XmppError::internal(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// SHA-256 hash helper.
pub(crate) fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Compare secrets without an early exit on the first differing byte.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Parsed client-first-message components.
#[derive(Debug, Clone)]
struct ClientFirstMessage {
    /// GS2 channel binding flag ('n', 'y', or 'p')
    gs2_cbind_flag: char,
    /// The full GS2 header, echoed back base64-encoded in `c=`
    gs2_header: String,
    authzid: Option<String>,
    username: String,
    client_nonce: String,
    /// The bare message (without GS2 header) for auth message computation
    bare: String,
}

/// Parsed client-final-message components.
#[derive(Debug, Clone)]
struct ClientFinalMessage {
    channel_binding: String,
    nonce: String,
    proof: String,
    /// Message without proof for auth message computation
    without_proof: String,
}

#[derive(Debug, Clone)]
struct ServerFirstMessage {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

/// Parse client-first-message.
///
/// Format: `gs2-header client-first-message-bare`
/// gs2-header: `[flag],authzid,`
/// client-first-message-bare: `n=username,r=nonce[,extensions]`
fn parse_client_first(message: &str) -> Result<ClientFirstMessage, XmppError> {
    let parts: Vec<&str> = message.splitn(3, ',').collect();
    if parts.len() < 3 {
        return Err(XmppError::auth_failed("Invalid client-first-message format"));
    }

    let gs2_cbind_flag = parts[0]
        .chars()
        .next()
        .ok_or_else(|| XmppError::auth_failed("Missing GS2 channel binding flag"))?;

    let authzid = if let Some(authzid) = parts[1].strip_prefix("a=") {
        Some(decode_sasl_name(authzid)?)
    } else if parts[1].is_empty() {
        None
    } else {
        return Err(XmppError::auth_failed("Invalid authzid format"));
    };

    let gs2_header = format!("{},{},", parts[0], parts[1]);
    let bare = parts[2].to_string();

    let mut username = None;
    let mut client_nonce = None;

    for attr in bare.split(',') {
        if let Some(val) = attr.strip_prefix("n=") {
            username = Some(decode_sasl_name(val)?);
        } else if let Some(val) = attr.strip_prefix("r=") {
            client_nonce = Some(val.to_string());
        } else if attr.starts_with("m=") {
            return Err(XmppError::auth_failed("Mandatory extensions are not supported"));
        }
    }

    let username = username
        .filter(|u| !u.is_empty())
        .ok_or_else(|| XmppError::auth_failed("Missing username in client-first-message"))?;
    let client_nonce = client_nonce
        .filter(|n| !n.is_empty())
        .ok_or_else(|| XmppError::auth_failed("Missing nonce in client-first-message"))?;

    Ok(ClientFirstMessage {
        gs2_cbind_flag,
        gs2_header,
        authzid,
        username,
        client_nonce,
        bare,
    })
}

/// Parse client-final-message.
///
/// Format: `c=channel-binding,r=nonce,p=proof`
fn parse_client_final(message: &str) -> Result<ClientFinalMessage, XmppError> {
    let mut channel_binding = None;
    let mut nonce = None;
    let mut proof = None;

    let proof_idx = message
        .rfind(",p=")
        .ok_or_else(|| XmppError::auth_failed("Missing proof in client-final-message"))?;

    let without_proof = &message[..proof_idx];

    for attr in message.split(',') {
        if let Some(val) = attr.strip_prefix("c=") {
            channel_binding = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("r=") {
            nonce = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("p=") {
            proof = Some(val.to_string());
        }
    }

    let channel_binding = channel_binding
        .ok_or_else(|| XmppError::auth_failed("Missing channel binding in client-final-message"))?;
    let nonce = nonce.ok_or_else(|| XmppError::auth_failed("Missing nonce in client-final-message"))?;
    let proof = proof.ok_or_else(|| XmppError::auth_failed("Missing proof in client-final-message"))?;

    Ok(ClientFinalMessage {
        channel_binding,
        nonce,
        proof,
        without_proof: without_proof.to_string(),
    })
}

/// Parse server-first-message: `r=nonce,s=salt,i=iterations`.
fn parse_server_first(message: &str) -> Result<ServerFirstMessage, XmppError> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for attr in message.split(',') {
        if let Some(val) = attr.strip_prefix("r=") {
            nonce = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("s=") {
            salt = Some(
                BASE64_STANDARD
                    .decode(val)
                    .map_err(|e| XmppError::auth_failed(format!("Invalid salt base64: {}", e)))?,
            );
        } else if let Some(val) = attr.strip_prefix("i=") {
            iterations = Some(
                val.parse::<u32>()
                    .map_err(|_| XmppError::auth_failed("Invalid iteration count"))?,
            );
        } else if attr.starts_with("m=") {
            return Err(XmppError::auth_failed("Mandatory extensions are not supported"));
        }
    }

    let iterations = iterations
        .filter(|i| *i > 0)
        .ok_or_else(|| XmppError::auth_failed("Missing iteration count in server-first-message"))?;

    Ok(ServerFirstMessage {
        nonce: nonce.ok_or_else(|| XmppError::auth_failed("Missing nonce in server-first-message"))?,
        salt: salt.ok_or_else(|| XmppError::auth_failed("Missing salt in server-first-message"))?,
        iterations,
    })
}

/// Decode a SASL name (RFC 5802 escaping).
/// - `=2C` -> `,`
/// - `=3D` -> `=`
fn decode_sasl_name(name: &str) -> Result<String, XmppError> {
    let mut result = String::new();
    let mut chars = name.chars();

    while let Some(c) = chars.next() {
        if c == '=' {
            let escape: String = chars.by_ref().take(2).collect();
            match escape.as_str() {
                "2C" => result.push(','),
                "3D" => result.push('='),
                _ => return Err(XmppError::auth_failed(format!("Invalid SASL name escape: ={}", escape))),
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

/// Encode a SASL name (RFC 5802 escaping).
/// - `,` -> `=2C`
/// - `=` -> `=3D`
pub fn encode_sasl_name(name: &str) -> String {
    let mut result = String::new();
    for c in name.chars() {
        match c {
            ',' => result.push_str("=2C"),
            '=' => result.push_str("=3D"),
            _ => result.push(c),
        }
    }
    result
}

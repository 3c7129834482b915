//! Bearer-token guard shared by every HTTP endpoint.
//!
//! One token list covers RPC and streaming alike. When enforcement is on
//! but no token is configured, the guard mints an ephemeral one at startup
//! so the server never silently runs open; the CLI prints it once.

use crate::util::random_hex;
use tracing::warn;

/// Bytes of entropy in a minted bearer token.
const TOKEN_BYTES: usize = 32;

/// Compare two strings in constant time with respect to their contents.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a fresh bearer token.
pub fn generate_token() -> String {
    random_hex(TOKEN_BYTES)
}

/// Holds the accepted bearer tokens and whether they are enforced.
pub struct TokenGuard {
    require_token: bool,
    tokens: Vec<String>,
    minted: Option<String>,
}

impl TokenGuard {
    pub fn new(require_token: bool, tokens: &[String]) -> Self {
        let tokens: Vec<String> = tokens
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let minted = if require_token && tokens.is_empty() {
            warn!("auth required but no token configured — minting an ephemeral one");
            Some(generate_token())
        } else {
            None
        };

        let mut all = tokens;
        if let Some(ref token) = minted {
            all.push(token.clone());
        }

        Self {
            require_token,
            tokens: all,
            minted,
        }
    }

    /// The token minted at startup, if any, so the CLI can show it once.
    pub fn ephemeral_token(&self) -> Option<&str> {
        self.minted.as_deref()
    }

    pub fn requires_token(&self) -> bool {
        self.require_token
    }

    /// Check a bearer token. Always true when enforcement is off.
    pub fn is_authorized(&self, token: &str) -> bool {
        if !self.require_token {
            return true;
        }
        // Scan the full list regardless of early match.
        let mut ok = false;
        for candidate in &self.tokens {
            ok |= constant_time_eq(candidate, token);
        }
        ok
    }
}

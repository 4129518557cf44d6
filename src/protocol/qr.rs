//! QR code pairing for WhatsApp authentication.
//!
//! The server hands out a list of pairing refs. Each ref becomes one QR
//! challenge; challenges are shown one after another, each for a bounded
//! window, until the phone scans one or the refs run out.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use qrcode::{render::unicode, QrCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::store::AuthState;

/// A QR payload the dashboard shows until it expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingChallenge {
    /// Data to encode in the QR code: `ref,noisePub,identityPub,advSecret`.
    pub code: String,
    /// Position of this challenge in the session's pairing attempt, from 1.
    pub sequence: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PairingChallenge {
    /// Render the challenge as a QR code for terminal display.
    pub fn render_ascii(&self) -> Result<String, QRError> {
        let code = QrCode::new(self.code.as_bytes())
            .map_err(|e| QRError::GenerationFailed(e.to_string()))?;

        Ok(code
            .render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build())
    }
}

/// QR code errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QRError {
    #[error("QR generation failed: {0}")]
    GenerationFailed(String),
}

/// Walks through the refs of one pairing round.
#[derive(Debug)]
pub struct PairingRotation {
    refs: Vec<String>,
    index: usize,
    key_suffix: String,
    current: PairingChallenge,
    expires_at: Instant,
}

impl PairingRotation {
    /// Start a rotation on the first ref. Returns `None` when `refs` is empty.
    pub fn start(
        refs: Vec<String>,
        auth: &AuthState,
        first_sequence: u32,
        window: Duration,
        now: Instant,
    ) -> Option<Self> {
        let first = refs.first()?.clone();
        let key_suffix = format!(
            "{},{},{}",
            STANDARD.encode(auth.noise_key.public),
            STANDARD.encode(auth.identity_key.public),
            STANDARD.encode(auth.adv_secret_key),
        );
        let current = challenge(&first, &key_suffix, first_sequence, window);

        Some(Self {
            refs,
            index: 0,
            key_suffix,
            current,
            expires_at: now + window,
        })
    }

    /// The challenge currently on display.
    pub fn current(&self) -> &PairingChallenge {
        &self.current
    }

    /// When the current challenge stops being valid.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Replace the expired challenge with the next ref.
    ///
    /// Returns `None` once every ref of the round was shown.
    pub fn advance(&mut self, window: Duration, now: Instant) -> Option<&PairingChallenge> {
        let next = self.refs.get(self.index + 1)?;
        self.index += 1;
        self.current = challenge(next, &self.key_suffix, self.current.sequence + 1, window);
        self.expires_at = now + window;
        Some(&self.current)
    }
}

fn challenge(reference: &str, key_suffix: &str, sequence: u32, window: Duration) -> PairingChallenge {
    let issued_at = Utc::now();
    let expires_at = issued_at
        + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(60));

    PairingChallenge {
        code: format!("{},{}", reference, key_suffix),
        sequence,
        issued_at,
        expires_at,
    }
}

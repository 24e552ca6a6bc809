use super::clock::{Clock, SystemClock};
use super::history::{NullTransferLog, TransferLog, TransferRecord};
use chrono::{DateTime, Utc};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use log::{debug, info, warn};
use rand::{rngs::OsRng, Rng};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use uuid::Uuid;

pub const CODE_LEN: usize = 6;
pub const CODE_SPACE: u32 = 1_000_000;
pub const DEFAULT_TRANSFER_TTL_SECS: u64 = 300;
pub const MAX_TRANSFER_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const MAX_CODE_ATTEMPTS: usize = 64;

pub type OwnerId = u64;
pub type TransferCode = heapless::String<CODE_LEN>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferToken {
    pub code: TransferCode,
    pub device_id: String,
    pub from_owner_id: OwnerId,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl TransferToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_pending(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.is_expired(now)
    }

    pub fn status(&self, now: DateTime<Utc>) -> TokenStatus {
        if self.used {
            TokenStatus::Used
        } else if self.is_expired(now) {
            TokenStatus::Expired
        } else {
            TokenStatus::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Pending,
    Used,
    Expired,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReceipt {
    pub device_id: String,
    pub from_owner_id: OwnerId,
    pub new_owner_id: OwnerId,
    pub transferred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    InvalidCode,
    AlreadyUsed,
    Expired,
    DeviceMismatch,
    SelfTransferRejected,
    NotFound,
    InvalidRequest(String),
    CodeSpaceExhausted,
}

impl TransferError {
    /// Stable tag used in failure responses.
    pub fn reason(&self) -> &'static str {
        match self {
            TransferError::InvalidCode => "invalid_code",
            TransferError::AlreadyUsed => "already_used",
            TransferError::Expired => "expired",
            TransferError::DeviceMismatch => "device_mismatch",
            TransferError::SelfTransferRejected => "self_transfer_rejected",
            TransferError::NotFound => "not_found",
            TransferError::InvalidRequest(_) => "invalid_request",
            TransferError::CodeSpaceExhausted => "code_space_exhausted",
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransferError::InvalidCode => write!(f, "Invalid transfer code"),
            TransferError::AlreadyUsed => write!(f, "Transfer code already used"),
            TransferError::Expired => write!(f, "Transfer code expired"),
            TransferError::DeviceMismatch => write!(f, "Device MAC mismatch"),
            TransferError::SelfTransferRejected => write!(f, "Cannot transfer to yourself"),
            TransferError::NotFound => write!(f, "Transfer not found"),
            TransferError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            TransferError::CodeSpaceExhausted => write!(f, "No free transfer code available"),
        }
    }
}

impl std::error::Error for TransferError {}

/// Device ids are compared with surrounding whitespace removed.
fn normalize_device_id(device_id: &str) -> &str {
    device_id.trim()
}

fn generate_code() -> Option<TransferCode> {
    let value = OsRng.gen_range(0..CODE_SPACE);
    let mut code = TransferCode::new();
    write!(code, "{:06}", value).ok()?;
    Some(code)
}

/// Pending, used and lapsed transfer tokens keyed by code. Expiry is checked
/// lazily on every operation; `purge_expired` only reclaims memory.
pub struct TransferRegistry {
    tokens: Mutex<CriticalSectionRawMutex, HashMap<TransferCode, TransferToken>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    log: Arc<dyn TransferLog>,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSFER_TTL_SECS)
    }
}

impl TransferRegistry {
    /// `ttl_secs` is capped at one week.
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::seconds(ttl_secs.min(MAX_TRANSFER_TTL_SECS) as i64),
            clock: Arc::new(SystemClock),
            log: Arc::new(NullTransferLog),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_log(mut self, log: Arc<dyn TransferLog>) -> Self {
        self.log = log;
        self
    }

    /// Issues a fresh code for `device_id`. Any code still pending for the
    /// same device is superseded.
    pub async fn initiate(
        &self,
        device_id: &str,
        from_owner_id: OwnerId,
    ) -> Result<TransferToken, TransferError> {
        let device_id = normalize_device_id(device_id);
        if device_id.is_empty() {
            return Err(TransferError::InvalidRequest("device id is empty".to_string()));
        }

        let now = self.clock.now();
        let mut tokens = self.tokens.lock().await;

        let before = tokens.len();
        tokens.retain(|_, token| !(token.device_id == device_id && token.is_pending(now)));
        let superseded = before - tokens.len();
        if superseded > 0 {
            info!("Superseded {} pending transfer code(s) for {}", superseded, device_id);
        }

        let code = (0..MAX_CODE_ATTEMPTS)
            .filter_map(|_| generate_code())
            .find(|code| tokens.get(code).map_or(true, |existing| !existing.is_pending(now)))
            .ok_or_else(|| {
                warn!("Could not find a free transfer code after {} attempts", MAX_CODE_ATTEMPTS);
                TransferError::CodeSpaceExhausted
            })?;

        let token = TransferToken {
            code: code.clone(),
            device_id: device_id.to_string(),
            from_owner_id,
            expires_at: now + self.ttl,
            used: false,
        };
        tokens.insert(code, token.clone());

        info!(
            "Transfer initiated for {} by owner {}, expires {}",
            token.device_id, from_owner_id, token.expires_at
        );
        Ok(token)
    }

    /// Consumes `code`. The checks run in a fixed order: unknown code, used,
    /// expired, device mismatch, self transfer.
    pub async fn verify(
        &self,
        code: &str,
        new_owner_id: OwnerId,
        device_id: &str,
    ) -> Result<TransferReceipt, TransferError> {
        let key = TransferCode::try_from(code).map_err(|_| TransferError::InvalidCode)?;
        let now = self.clock.now();
        let mut tokens = self.tokens.lock().await;

        let token = tokens.get_mut(&key).ok_or(TransferError::InvalidCode)?;
        if token.used {
            return Err(TransferError::AlreadyUsed);
        }
        if token.is_expired(now) {
            return Err(TransferError::Expired);
        }
        if token.device_id != normalize_device_id(device_id) {
            return Err(TransferError::DeviceMismatch);
        }
        if token.from_owner_id == new_owner_id {
            return Err(TransferError::SelfTransferRejected);
        }

        token.used = true;
        let receipt = TransferReceipt {
            device_id: token.device_id.clone(),
            from_owner_id: token.from_owner_id,
            new_owner_id,
            transferred_at: now,
        };
        drop(tokens);

        self.log.record(TransferRecord {
            id: Uuid::new_v4(),
            device_id: receipt.device_id.clone(),
            from_owner_id: receipt.from_owner_id,
            to_owner_id: receipt.new_owner_id,
            transferred_at: receipt.transferred_at,
        });

        info!(
            "Device {} transferred from owner {} to owner {}",
            receipt.device_id, receipt.from_owner_id, receipt.new_owner_id
        );
        Ok(receipt)
    }

    /// Withdraws a pending code. Used or lapsed codes report `NotFound`.
    pub async fn cancel(&self, code: &str) -> Result<TransferToken, TransferError> {
        let key = TransferCode::try_from(code).map_err(|_| TransferError::NotFound)?;
        let now = self.clock.now();
        let mut tokens = self.tokens.lock().await;

        match tokens.get(&key) {
            Some(token) if token.is_pending(now) => {}
            _ => return Err(TransferError::NotFound),
        }
        let token = tokens.remove(&key).ok_or(TransferError::NotFound)?;
        info!("Transfer code for {} cancelled", token.device_id);
        Ok(token)
    }

    pub async fn status(&self, code: &str) -> Option<TokenStatus> {
        let key = TransferCode::try_from(code).ok()?;
        let now = self.clock.now();
        let tokens = self.tokens.lock().await;
        tokens.get(&key).map(|token| token.status(now))
    }

    pub async fn pending_count(&self) -> usize {
        let now = self.clock.now();
        let tokens = self.tokens.lock().await;
        tokens.values().filter(|token| token.is_pending(now)).count()
    }

    pub fn history(&self, device_id: Option<&str>) -> Vec<TransferRecord> {
        self.log.history(device_id)
    }

    /// Drops every token whose lifetime has passed, used or not.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, token| !token.is_expired(now));
        let purged = before - tokens.len();
        if purged > 0 {
            debug!("Purged {} lapsed transfer code(s)", purged);
        }
        purged
    }
}

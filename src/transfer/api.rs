//! Request and response shapes of the ownership-transfer surface.

use super::history::TransferRecord;
use super::registry::{OwnerId, TransferCode, TransferError, TransferRegistry};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransferRequest {
    #[serde(rename_all = "camelCase")]
    Initiate {
        device_id: String,
        from_owner_id: OwnerId,
    },
    #[serde(rename_all = "camelCase")]
    Verify {
        code: String,
        new_owner_id: OwnerId,
        device_id: String,
    },
    Cancel {
        code: String,
    },
    #[serde(rename_all = "camelCase")]
    History {
        #[serde(default)]
        device_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub code: TransferCode,
    pub expires_at: DateTime<Utc>,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub success: bool,
    pub device_id: String,
    pub from_owner_id: OwnerId,
    pub new_owner_id: OwnerId,
    pub transferred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub code: TransferCode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureResponse {
    pub success: bool,
    pub reason: &'static str,
    pub message: String,
}

impl From<TransferError> for FailureResponse {
    fn from(err: TransferError) -> Self {
        Self {
            success: false,
            reason: err.reason(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TransferResponse {
    Initiated(InitiateResponse),
    Verified(VerifyResponse),
    Cancelled(CancelResponse),
    History(Vec<TransferRecord>),
    Failed(FailureResponse),
}

impl From<TransferError> for TransferResponse {
    fn from(err: TransferError) -> Self {
        TransferResponse::Failed(err.into())
    }
}

impl TransferResponse {
    pub fn is_success(&self) -> bool {
        !matches!(self, TransferResponse::Failed(_))
    }
}

/// Front door for transfer requests arriving over any transport.
#[derive(Clone)]
pub struct TransferApi {
    registry: Arc<TransferRegistry>,
}

impl TransferApi {
    pub fn new(registry: Arc<TransferRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.registry
    }

    pub async fn handle(&self, request: TransferRequest) -> TransferResponse {
        debug!("Transfer request: {:?}", request);
        let result = match request {
            TransferRequest::Initiate {
                device_id,
                from_owner_id,
            } => self
                .registry
                .initiate(&device_id, from_owner_id)
                .await
                .map(|token| {
                    TransferResponse::Initiated(InitiateResponse {
                        code: token.code,
                        expires_at: token.expires_at,
                        device_id: token.device_id,
                    })
                }),
            TransferRequest::Verify {
                code,
                new_owner_id,
                device_id,
            } => self
                .registry
                .verify(&code, new_owner_id, &device_id)
                .await
                .map(|receipt| {
                    TransferResponse::Verified(VerifyResponse {
                        success: true,
                        device_id: receipt.device_id,
                        from_owner_id: receipt.from_owner_id,
                        new_owner_id: receipt.new_owner_id,
                        transferred_at: receipt.transferred_at,
                    })
                }),
            TransferRequest::Cancel { code } => {
                self.registry.cancel(&code).await.map(|token| {
                    TransferResponse::Cancelled(CancelResponse {
                        success: true,
                        code: token.code,
                    })
                })
            }
            TransferRequest::History { device_id } => Ok(TransferResponse::History(
                self.registry.history(device_id.as_deref()),
            )),
        };

        result.unwrap_or_else(|err| {
            warn!("Transfer request rejected: {}", err);
            err.into()
        })
    }

    /// Decodes one JSON request, handles it, and encodes the response.
    pub async fn handle_json(&self, line: &str) -> String {
        let response = match serde_json::from_str::<TransferRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!("Malformed transfer request: {}", e);
                TransferError::InvalidRequest(e.to_string()).into()
            }
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(
                r#"{{"success":false,"reason":"internal","message":"{}"}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::history::MemoryTransferLog;
    use embassy_futures::block_on;
    use serde_json::Value;

    fn api() -> TransferApi {
        let registry = TransferRegistry::default().with_log(Arc::new(MemoryTransferLog::new()));
        TransferApi::new(Arc::new(registry))
    }

    fn call(api: &TransferApi, line: &str) -> Value {
        serde_json::from_str(&block_on(api.handle_json(line))).unwrap()
    }

    #[test]
    fn test_request_decoding() {
        let request: TransferRequest = serde_json::from_str(
            r#"{"op":"verify","code":"012345","newOwnerId":2,"deviceId":"AA:BB:CC:DD:EE:FF"}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            TransferRequest::Verify {
                code: "012345".to_string(),
                new_owner_id: 2,
                device_id: "AA:BB:CC:DD:EE:FF".to_string(),
            }
        );

        let request: TransferRequest = serde_json::from_str(r#"{"op":"history"}"#).unwrap();
        assert_eq!(request, TransferRequest::History { device_id: None });
    }

    #[test]
    fn test_full_transfer_over_json() {
        let api = api();
        let initiated = call(
            &api,
            r#"{"op":"initiate","deviceId":"AA:BB:CC:DD:EE:FF","fromOwnerId":1}"#,
        );
        let code = initiated["code"].as_str().unwrap().to_string();
        assert_eq!(code.len(), 6);
        assert_eq!(initiated["deviceId"], "AA:BB:CC:DD:EE:FF");
        assert!(initiated["expiresAt"].is_string());

        let verify = format!(
            r#"{{"op":"verify","code":"{}","newOwnerId":2,"deviceId":"AA:BB:CC:DD:EE:FF"}}"#,
            code
        );
        let verified = call(&api, &verify);
        assert_eq!(verified["success"], true);
        assert_eq!(verified["fromOwnerId"], 1);
        assert_eq!(verified["newOwnerId"], 2);
        assert!(verified["transferredAt"].is_string());

        let again = call(&api, &verify);
        assert_eq!(again["success"], false);
        assert_eq!(again["reason"], "already_used");

        let history = call(&api, r#"{"op":"history","deviceId":"AA:BB:CC:DD:EE:FF"}"#);
        let entries = history.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["toOwnerId"], 2);
    }

    #[test]
    fn test_cancel_over_json() {
        let api = api();
        let token = block_on(api.registry().initiate("AA:BB:CC:DD:EE:FF", 1)).unwrap();
        let cancel = format!(r#"{{"op":"cancel","code":"{}"}}"#, token.code);

        let cancelled = call(&api, &cancel);
        assert_eq!(cancelled["success"], true);
        assert_eq!(cancelled["code"], token.code.as_str());

        let missing = call(&api, &cancel);
        assert_eq!(missing["reason"], "not_found");
    }

    #[test]
    fn test_malformed_requests() {
        let api = api();
        assert_eq!(call(&api, "not json")["reason"], "invalid_request");
        assert_eq!(call(&api, r#"{"op":"steal"}"#)["reason"], "invalid_request");
        assert_eq!(
            call(&api, r#"{"op":"initiate","deviceId":"","fromOwnerId":1}"#)["reason"],
            "invalid_request"
        );
        assert_eq!(
            call(
                &api,
                r#"{"op":"verify","code":"000000","newOwnerId":2,"deviceId":"AA"}"#
            )["reason"],
            "invalid_code"
        );
    }

    #[test]
    fn test_failure_shape() {
        let response: TransferResponse = TransferError::SelfTransferRejected.into();
        assert!(!response.is_success());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["reason"], "self_transfer_rejected");
        assert_eq!(json["message"], "Cannot transfer to yourself");
    }
}

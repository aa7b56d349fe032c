//! Single-record writes through the sObject REST resource.
//!
//! Used for the synchronous `upsert_record` / `update_record` paths, where a
//! bulk job would be overkill. Row-level rejections (validation rules,
//! missing required fields) come back as a failed [`RowOutcome`]; transport
//! and auth problems come back as `AppError`.

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use url::Url;

use crate::error::AppError;
use crate::salesforce::client::{
    parse_api_errors, parse_error_response, RequestBody, SalesforceClient,
};
use crate::salesforce::transport::RowOutcome;
use crate::salesforce::{redact_id, Record, API_VERSION};

/// Field holding the Salesforce record id.
const ID_FIELD: &str = "Id";

/// Body Salesforce returns for an upsert that answered 200/201.
#[derive(Debug, Deserialize)]
struct WireUpsertResponse {
    id: Option<String>,
    created: Option<bool>,
}

/// Client for writing one record at a time.
#[derive(Clone)]
pub struct SObjectClient {
    client: SalesforceClient,
}

impl SObjectClient {
    pub fn new(client: SalesforceClient) -> Self {
        Self { client }
    }

    /// Upserts `record` keyed on `external_id_field`.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidArgument` - the record has no usable external id
    /// - `AppError::SessionExpired` - the access token was rejected
    /// - `AppError::RateLimited` / `AppError::ConnectionFailed`
    pub async fn upsert_record(
        &self,
        object: &str,
        external_id_field: &str,
        record: &Record,
    ) -> Result<RowOutcome, AppError> {
        let key = match record.get(external_id_field) {
            None | Some(Value::Null) => {
                return Err(AppError::InvalidArgument(format!(
                    "record is missing external id field {}",
                    external_id_field
                )))
            }
            Some(Value::String(s)) if s.is_empty() => {
                return Err(AppError::InvalidArgument(format!(
                    "record has an empty external id field {}",
                    external_id_field
                )))
            }
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };

        let url = self.sobject_url(object, &[external_id_field, &key])?;
        let body = body_without(record, &[external_id_field, ID_FIELD]);

        info!("[SFDC] PATCH /sobjects/{}/{} (upsert)", object, external_id_field);

        let response = self
            .client
            .execute(Method::PATCH, url, RequestBody::Json(body))
            .await?;

        let status = response.status();
        match status {
            StatusCode::CREATED | StatusCode::OK => {
                let wire: WireUpsertResponse = response.json().await.map_err(|e| {
                    AppError::SalesforceError(format!("Failed to parse upsert response: {}", e))
                })?;
                let created = wire.created.unwrap_or(status == StatusCode::CREATED);
                Ok(RowOutcome::succeeded(wire.id, Some(created)))
            }
            StatusCode::NO_CONTENT => Ok(RowOutcome::succeeded(None, Some(false))),
            _ => rejected_or_error(response, "sObject or external id field not found").await,
        }
    }

    /// Updates the record identified by its `Id` field.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidArgument` - the record has no `Id`
    /// - `AppError::SessionExpired` - the access token was rejected
    pub async fn update_record(&self, object: &str, record: &Record) -> Result<RowOutcome, AppError> {
        let id = match record.get(ID_FIELD) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => {
                return Err(AppError::InvalidArgument(
                    "record is missing an Id".to_string(),
                ))
            }
        };

        let url = self.sobject_url(object, &[&id])?;
        let body = body_without(record, &[ID_FIELD]);

        info!("[SFDC] PATCH /sobjects/{}/{} (update)", object, redact_id(&id));

        let response = self
            .client
            .execute(Method::PATCH, url, RequestBody::Json(body))
            .await?;

        if response.status().is_success() {
            return Ok(RowOutcome::succeeded(Some(id), Some(false)));
        }

        rejected_or_error(response, "Record not found").await
    }

    /// Builds `/services/data/vXX.X/sobjects/{object}/{segments...}` with
    /// each segment percent-encoded.
    fn sobject_url(&self, object: &str, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = self
            .client
            .build_url(&format!("/services/data/{}/sobjects/", API_VERSION))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Internal("Instance URL cannot hold a path".to_string()))?
            .pop_if_empty()
            .push(object)
            .extend(segments);
        Ok(url)
    }
}

/// Copy of `record` without the key fields, which travel in the URL.
fn body_without(record: &Record, skip: &[&str]) -> Value {
    Value::Object(
        record
            .iter()
            .filter(|(k, _)| !skip.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

/// A 400 carrying Salesforce's error array is a row rejection; anything
/// else is an error.
async fn rejected_or_error(
    response: reqwest::Response,
    not_found: &str,
) -> Result<RowOutcome, AppError> {
    if response.status() != StatusCode::BAD_REQUEST {
        return Err(parse_error_response(response, not_found).await);
    }

    let body = response.text().await.unwrap_or_default();
    match parse_api_errors(&body).into_iter().next() {
        Some(first) => Ok(RowOutcome::failed(
            None,
            format!("[{}] {}", first.error_code, first.message),
        )),
        None => Err(AppError::SalesforceError(
            "HTTP 400 - Bad Request".to_string(),
        )),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! Convenience wrappers for the Cortex calls the demo flow needs.
//!
//! Each one only builds the `params` object and forwards to
//! [`Client::call`]; payloads are returned untouched.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::client::Client;
use crate::error::{CortexError, TransportError};
use crate::protocol::Warning;

/// Data streams a session can subscribe to.
pub const STREAMS: &[&str] = &["eeg", "mot", "dev", "eq", "pow", "met", "com", "fac", "sys"];

/// Warning code sent when a headset scan triggered by `refresh` finishes.
pub const WARNING_HEADSET_SCAN_FINISHED: i64 = 142;

/// Warning codes that report a headset connection attempt succeeded.
pub const WARNINGS_HEADSET_CONNECTED: &[i64] = &[100, 101, 102, 113];

/// Optional fields of a new subject. Unset fields are left out of the request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDetails {
    /// `YYYY-MM-DD`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    /// `M`, `F` or `U`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// Optional fields of a new record.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Merge the serialized `details` object into `params`.
fn with_details<T: Serialize>(mut params: Value, details: &T) -> Result<Value, CortexError> {
    let extra = serde_json::to_value(details).map_err(|e| TransportError::Encode(e.to_string()))?;
    if let (Some(params), Value::Object(extra)) = (params.as_object_mut(), extra) {
        params.extend(extra);
    }
    Ok(params)
}

fn control_device_params(command: &str, headset_id: Option<&str>) -> Value {
    let mut params = json!({"command": command});
    if let Some(headset) = headset_id {
        params["headset"] = json!(headset);
    }
    params
}

impl Client {
    pub fn get_cortex_info(&self) -> Result<Value, CortexError> {
        self.call("getCortexInfo", json!({}))
    }

    pub fn get_user_login(&self) -> Result<Value, CortexError> {
        self.call("getUserLogin", json!({}))
    }

    pub fn request_access(&self, client_id: &str, client_secret: &str) -> Result<Value, CortexError> {
        self.call(
            "requestAccess",
            json!({"clientId": client_id, "clientSecret": client_secret}),
        )
    }

    pub fn authorize(&self, client_id: &str, client_secret: &str) -> Result<Value, CortexError> {
        self.call(
            "authorize",
            json!({"clientId": client_id, "clientSecret": client_secret}),
        )
    }

    pub fn generate_new_token(
        &self,
        cortex_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Value, CortexError> {
        self.call(
            "generateNewToken",
            json!({
                "cortexToken": cortex_token,
                "clientId": client_id,
                "clientSecret": client_secret
            }),
        )
    }

    pub fn get_user_information(&self, cortex_token: &str) -> Result<Value, CortexError> {
        self.call("getUserInformation", json!({"cortexToken": cortex_token}))
    }

    /// `command` is one of `refresh`, `connect`, `disconnect`.
    pub fn control_device(&self, command: &str, headset_id: Option<&str>) -> Result<Value, CortexError> {
        self.call("controlDevice", control_device_params(command, headset_id))
    }

    /// `controlDevice`, then wait for the warning the service pushes when the
    /// command completes (142 after `refresh`, 100/101/102/113 after `connect`).
    pub fn control_device_and_await_warning(
        &self,
        command: &str,
        headset_id: Option<&str>,
        timeout: Duration,
    ) -> Result<(Value, Warning), CortexError> {
        self.call_then_await_warning(
            "controlDevice",
            control_device_params(command, headset_id),
            timeout,
        )
    }

    pub fn query_headsets(&self) -> Result<Value, CortexError> {
        self.call("queryHeadsets", json!({}))
    }

    pub fn create_session(
        &self,
        cortex_token: &str,
        headset_id: &str,
        status: &str,
    ) -> Result<Value, CortexError> {
        self.call(
            "createSession",
            json!({"cortexToken": cortex_token, "headset": headset_id, "status": status}),
        )
    }

    /// Subscribe `session_id` to `streams`; data then arrives on the
    /// `stream_data_<tag>` channels (see [`Client::on_stream`]).
    pub fn subscribe_streams(
        &self,
        cortex_token: &str,
        session_id: &str,
        streams: &[&str],
    ) -> Result<Value, CortexError> {
        self.call(
            "subscribe",
            json!({"cortexToken": cortex_token, "session": session_id, "streams": streams}),
        )
    }

    /// `query` and `order_by` are passed through, e.g.
    /// `json!({"sex": "M"})` and `json!([{"subjectName": "DESC"}])`.
    pub fn query_subjects(
        &self,
        cortex_token: &str,
        query: Value,
        order_by: Value,
    ) -> Result<Value, CortexError> {
        self.call(
            "querySubjects",
            json!({"cortexToken": cortex_token, "query": query, "orderBy": order_by}),
        )
    }

    pub fn create_subject(
        &self,
        cortex_token: &str,
        subject_name: &str,
        details: &SubjectDetails,
    ) -> Result<Value, CortexError> {
        let params = with_details(
            json!({"cortexToken": cortex_token, "subjectName": subject_name}),
            details,
        )?;
        self.call("createSubject", params)
    }

    pub fn query_records(
        &self,
        cortex_token: &str,
        query: Value,
        order_by: Value,
    ) -> Result<Value, CortexError> {
        self.call(
            "queryRecords",
            json!({"cortexToken": cortex_token, "query": query, "orderBy": order_by}),
        )
    }

    /// Full record information, markers included.
    pub fn get_record_infos(&self, cortex_token: &str, record_ids: &[&str]) -> Result<Value, CortexError> {
        self.call(
            "getRecordInfos",
            json!({"cortexToken": cortex_token, "recordIds": record_ids}),
        )
    }

    /// Start recording on `session_id`. The session must be active.
    pub fn create_record(
        &self,
        cortex_token: &str,
        session_id: &str,
        title: &str,
        details: &RecordDetails,
    ) -> Result<Value, CortexError> {
        let params = with_details(
            json!({"cortexToken": cortex_token, "session": session_id, "title": title}),
            details,
        )?;
        self.call("createRecord", params)
    }

    /// `status` is `active` or `close`.
    pub fn update_session(
        &self,
        cortex_token: &str,
        session_id: &str,
        status: &str,
    ) -> Result<Value, CortexError> {
        self.call(
            "updateSession",
            json!({"cortexToken": cortex_token, "session": session_id, "status": status}),
        )
    }
}

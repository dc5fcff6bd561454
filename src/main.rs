//! Cortex Link demo
//!
//! Walks through the usual start-of-session sequence against a running
//! Cortex service: service info, login check, access request, authorization,
//! subject selection and then either a new recording or the newest record.
//!
//! Configuration comes from the environment:
//!
//! - `CORTEX_ENDPOINT` (default `wss://localhost:6868`)
//! - `CORTEX_CLIENT_ID`, `CORTEX_CLIENT_SECRET` (required)
//! - `CORTEX_TOKEN`: existing token to refresh instead of authorizing again
//! - `CORTEX_SUBJECT`: subject to use, created if missing (default: first listed)
//! - `CORTEX_RECORD_TITLE`: record a new session under this title
//! - `CORTEX_STREAMS`: comma-separated streams for a new recording (default `met,mot`)
//! - `CORTEX_REQUEST_TIMEOUT_SECS`, `CORTEX_CONNECT_TIMEOUT_SECS`
//! - `RUST_LOG` (default `cortex_link=info`)

use std::time::Duration;

use anyhow::{bail, Context, Result};
use cortex_link::cortex::{
    RecordDetails, SubjectDetails, WARNINGS_HEADSET_CONNECTED, WARNING_HEADSET_SCAN_FINISHED,
};
use cortex_link::{Client, ClientConfig};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long a headset scan or connect may take before the service warns.
const HEADSET_WARNING_TIMEOUT: Duration = Duration::from_secs(30);

/// Demo settings that are not part of the client configuration.
struct DemoOptions {
    client_id: String,
    client_secret: String,
    token: Option<String>,
    subject: Option<String>,
    record_title: Option<String>,
    streams: Vec<String>,
}

impl DemoOptions {
    fn from_env() -> Result<Self> {
        let optional = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let streams = optional("CORTEX_STREAMS")
            .unwrap_or_else(|| "met,mot".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            client_id: std::env::var("CORTEX_CLIENT_ID").context("CORTEX_CLIENT_ID is not set")?,
            client_secret: std::env::var("CORTEX_CLIENT_SECRET")
                .context("CORTEX_CLIENT_SECRET is not set")?,
            token: optional("CORTEX_TOKEN"),
            subject: optional("CORTEX_SUBJECT"),
            record_title: optional("CORTEX_RECORD_TITLE"),
            streams,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cortex_link=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting Cortex Link v{}", env!("CARGO_PKG_VERSION"));

    let options = DemoOptions::from_env()?;
    let config = ClientConfig::from_env();
    let client = Client::connect(config.clone())
        .with_context(|| format!("Failed to connect to {}", config.endpoint))?;

    let result = run(&client, &options);
    client.close();

    if let Err(e) = &result {
        tracing::error!("Demo failed: {:#}", e);
    } else {
        tracing::info!("Cortex Link exited cleanly");
    }
    result
}

fn run(client: &Client, options: &DemoOptions) -> Result<()> {
    println!("cortex info: {}", client.get_cortex_info()?);

    let token = authorize_user(client, options)?;
    display_user_info(client, &token)?;

    let Some(subject) = choose_subject(client, &token, options.subject.as_deref())? else {
        println!("no subject selected");
        return Ok(());
    };
    print_fields("subject", &subject);
    let subject_name = subject
        .get("subjectName")
        .and_then(Value::as_str)
        .context("subject has no subjectName")?;

    match &options.record_title {
        Some(title) => create_record(client, &token, subject_name, title, &options.streams),
        None => show_newest_record(client, &token, subject_name),
    }
}

fn authorize_user(client: &Client, options: &DemoOptions) -> Result<String> {
    let logins = client.get_user_login()?;
    match logins.get(0).and_then(|l| l.get("username")).and_then(Value::as_str) {
        Some(username) => {
            println!("logged in as {}", username);
            if let Some(last) = logins[0].get("lastLoginTime").and_then(Value::as_str) {
                println!("last login: {}", last);
            }
        }
        None => bail!("No user is logged in to the EMOTIV launcher"),
    }

    let access = client.request_access(&options.client_id, &options.client_secret)?;
    if access.get("accessGranted").and_then(Value::as_bool) != Some(true) {
        bail!("Please approve this application in the EMOTIV launcher");
    }

    let auth = match &options.token {
        Some(token) => client.generate_new_token(token, &options.client_id, &options.client_secret)?,
        None => client.authorize(&options.client_id, &options.client_secret)?,
    };
    auth.get("cortexToken")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("no cortexToken in reply")
}

fn display_user_info(client: &Client, token: &str) -> Result<()> {
    let user = client.get_user_information(token)?;
    println!("user information ---");
    for key in ["username", "firstName", "lastName"] {
        println!("\t{}: {}", key, user.get(key).unwrap_or(&Value::Null));
    }
    if let Some(accepted) = user.pointer("/licenseAgreement/accepted") {
        println!("\tlicense agreement: {}", accepted);
    }
    Ok(())
}

/// The `key` array of a query reply, or the reply itself if it is an array.
fn listed(reply: &Value, key: &str) -> Vec<Value> {
    reply
        .get(key)
        .unwrap_or(reply)
        .as_array()
        .cloned()
        .unwrap_or_default()
}

fn choose_subject(client: &Client, token: &str, wanted: Option<&str>) -> Result<Option<Value>> {
    let reply = client.query_subjects(token, json!({}), json!([{"subjectName": "DESC"}]))?;
    let subjects = listed(&reply, "subjects");
    println!("{} subject(s) found", subjects.len());
    for (i, subject) in subjects.iter().enumerate() {
        println!("{}: {}", i, subject.get("subjectName").unwrap_or(&Value::Null));
    }

    let Some(wanted) = wanted else {
        return Ok(subjects.into_iter().next());
    };
    if let Some(subject) = subjects
        .into_iter()
        .find(|s| s.get("subjectName").and_then(Value::as_str) == Some(wanted))
    {
        return Ok(Some(subject));
    }

    let created = client.create_subject(token, wanted, &SubjectDetails::default())?;
    println!("subject {} created", wanted);
    Ok(Some(created))
}

fn show_newest_record(client: &Client, token: &str, subject_name: &str) -> Result<()> {
    let reply = client.query_records(
        token,
        json!({"keyword": subject_name}),
        json!([{"startDatetime": "DESC"}]),
    )?;
    let records = listed(&reply, "records");
    println!("{} record(s) found for {}", records.len(), subject_name);
    for (i, record) in records.iter().enumerate() {
        println!("{}: {}", i, record.get("title").unwrap_or(&Value::Null));
    }

    let Some(uuid) = records
        .first()
        .and_then(|r| r.get("uuid"))
        .and_then(Value::as_str)
    else {
        return Ok(());
    };
    let infos = client.get_record_infos(token, &[uuid])?;
    if let Some(record) = infos.get(0) {
        print_fields("record", record);
    }
    Ok(())
}

fn create_record(
    client: &Client,
    token: &str,
    subject_name: &str,
    title: &str,
    streams: &[String],
) -> Result<()> {
    let headset_id = find_headset(client)?;

    let session = client.create_session(token, &headset_id, "open")?;
    let session_id = session
        .get("id")
        .and_then(Value::as_str)
        .context("createSession returned no session id")?;

    let streams: Vec<&str> = streams.iter().map(String::as_str).collect();
    let subscribed = client.subscribe_streams(token, session_id, &streams)?;
    println!("success: {}", subscribed.get("success").unwrap_or(&Value::Null));
    println!("failure: {}", subscribed.get("failure").unwrap_or(&Value::Null));

    client.update_session(token, session_id, "active")?;
    let details = RecordDetails {
        subject_name: Some(subject_name.to_string()),
        ..Default::default()
    };
    let record = client.create_record(token, session_id, title, &details)?;
    println!("record created");
    print_fields("record", record.get("record").unwrap_or(&record));
    Ok(())
}

fn find_headset(client: &Client) -> Result<String> {
    let (reply, warning) =
        client.control_device_and_await_warning("refresh", None, HEADSET_WARNING_TIMEOUT)?;
    println!("{}", reply);
    if warning.code != WARNING_HEADSET_SCAN_FINISHED {
        tracing::warn!("Expected headset scan warning, got {}", warning.code);
    }

    let headsets = client.query_headsets()?;
    println!("headset(s) found:");
    for headset in headsets.as_array().into_iter().flatten() {
        println!("- {}", headset.get("id").unwrap_or(&Value::Null));
    }
    let headset_id = headsets
        .get(0)
        .and_then(|h| h.get("id"))
        .and_then(Value::as_str)
        .context("no headsets found")?
        .to_string();

    let (reply, warning) = client.control_device_and_await_warning(
        "connect",
        Some(&headset_id),
        HEADSET_WARNING_TIMEOUT,
    )?;
    println!("{}", reply);
    if WARNINGS_HEADSET_CONNECTED.contains(&warning.code) {
        println!("headset {} connected", headset_id);
    } else {
        println!("headset warning {}: {}", warning.code, warning.message);
    }
    Ok(headset_id)
}

fn print_fields(label: &str, value: &Value) {
    println!("{} information ---", label);
    match value.as_object() {
        Some(fields) => {
            for (key, field) in fields {
                println!("{}: {}", key, field);
            }
        }
        None => println!("{}", value),
    }
}

//! `orgflow publish`: put one change event on the bus.

use crate::server::{build_connector, cli_error, load_config};
use anyhow::{bail, Context, Result};
use orgflow_core::{retry_with_backoff, ConnectionEvents, Error, Event, PublishOutcome, RetryConfig};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Arguments for a single publish
#[derive(Debug, Clone)]
pub struct PublishArgs {
    pub event_type: String,
    pub target: String,
    pub data: Option<String>,
    pub organization: Option<String>,
    pub id: Option<String>,
}

pub async fn run(args: PublishArgs) -> Result<()> {
    let config = load_config().context("Failed to load configuration")?;
    let organization = args
        .organization
        .clone()
        .filter(|org| !org.trim().is_empty())
        .or_else(|| Some(config.organization.clone()).filter(|org| !org.trim().is_empty()));
    let Some(organization) = organization else {
        bail!("No organization: pass --organization or set GITHUB_ORG");
    };

    let event = build_event(&organization, &args)?;
    let subject = event.subject().map_err(cli_error)?;

    let payload = event.to_payload().map_err(cli_error)?;
    let events = ConnectionEvents::default();
    let connector = build_connector(&config, &events, false)?;

    let (connector, subject_ref, payload, id) =
        (&connector, &subject, &payload, args.id.as_deref());
    let outcome = retry_with_backoff(
        &publish_retry(),
        || async move {
            let session = connector.connect().await?;
            let result = session.publish(subject_ref, payload.clone(), id).await;
            if let Err(e) = session.close().await {
                warn!(error = %e, "Closing broker session failed");
            }
            result
        },
        Error::is_retryable,
    )
    .await
    .map_err(cli_error)?;

    match outcome {
        PublishOutcome::Accepted => println!("Published {} for {}", subject, event.target),
        PublishOutcome::Duplicate => println!("Duplicate of an earlier publish, dropped: {}", subject),
    }
    Ok(())
}

fn publish_retry() -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(3)
        .with_initial_delay(Duration::from_millis(500))
}

fn build_event(organization: &str, args: &PublishArgs) -> Result<Event> {
    let mut event = Event::new(organization, args.target.clone(), args.event_type.clone());
    if let Some(raw) = &args.data {
        match serde_json::from_str::<Value>(raw).context("--data is not valid JSON")? {
            Value::Object(data) => event.data = data,
            _ => bail!("--data must be a JSON object"),
        }
    }
    Ok(event)
}

//! Notification channel dispatch.
//!
//! Channel settings live as JSON in the database; each kind deserializes its
//! own settings struct. Dispatch failures are returned to the caller, which
//! isolates them per channel.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::db::{Alert, AlertChannel, Site};

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("unknown channel kind: {0}")]
    UnknownKind(String),
    #[error("bad channel settings: {0}")]
    Settings(#[from] serde_json::Error),
    #[error("bad email address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("email build failed: {0}")]
    EmailBuild(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    WebhookStatus(u16),
}

#[derive(Debug, Deserialize)]
struct EmailSettings {
    smtp_host: String,
    #[serde(default = "default_smtp_port")]
    smtp_port: u16,
    username: String,
    password: String,
    from: String,
    to: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Deserialize)]
struct WebhookSettings {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct BotSettings {
    url: String,
    #[serde(default)]
    token: Option<String>,
}

/// Deliver one alert through one channel.
pub async fn dispatch(
    http: &reqwest::Client,
    channel: &AlertChannel,
    site: &Site,
    alert: &Alert,
) -> Result<(), ChannelError> {
    match channel.kind.as_str() {
        "email" => send_email(&channel.settings, site, alert).await,
        "webhook" => send_webhook(http, &channel.settings, site, alert).await,
        "bot" => send_bot(http, &channel.settings, site, alert).await,
        other => Err(ChannelError::UnknownKind(other.to_string())),
    }
}

fn subject(site: &Site, alert: &Alert) -> String {
    format!(
        "[{}] {}: {}",
        alert.severity.as_str().to_uppercase(),
        alert.category.as_str(),
        site.name
    )
}

async fn send_email(settings: &str, site: &Site, alert: &Alert) -> Result<(), ChannelError> {
    let settings: EmailSettings = serde_json::from_str(settings)?;

    let mut builder = Message::builder()
        .from(settings.from.parse()?)
        .subject(subject(site, alert))
        .header(ContentType::TEXT_PLAIN);
    for to in &settings.to {
        builder = builder.to(to.parse()?);
    }
    let body = format!(
        "{}\n\nSite: {} ({})\nTime: {}\n",
        alert.message, site.name, site.url, alert.created_at
    );
    let message = builder.body(body)?;

    let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.smtp_host)?
        .port(settings.smtp_port)
        .credentials(Credentials::new(settings.username, settings.password))
        .build();
    transport.send(message).await?;
    Ok(())
}

async fn send_webhook(
    http: &reqwest::Client,
    settings: &str,
    site: &Site,
    alert: &Alert,
) -> Result<(), ChannelError> {
    let settings: WebhookSettings = serde_json::from_str(settings)?;

    let mut req = http.post(&settings.url).json(&serde_json::json!({
        "site_id": site.id,
        "site_name": site.name,
        "site_url": site.url,
        "category": alert.category.as_str(),
        "severity": alert.severity.as_str(),
        "message": alert.message,
        "created_at": alert.created_at.to_rfc3339(),
    }));
    for (name, value) in &settings.headers {
        req = req.header(name, value);
    }

    let resp = req.send().await?;
    if !resp.status().is_success() {
        return Err(ChannelError::WebhookStatus(resp.status().as_u16()));
    }
    Ok(())
}

async fn send_bot(
    http: &reqwest::Client,
    settings: &str,
    site: &Site,
    alert: &Alert,
) -> Result<(), ChannelError> {
    let settings: BotSettings = serde_json::from_str(settings)?;

    let mut req = http.post(&settings.url).json(&serde_json::json!({
        "text": format!("{}: {}", subject(site, alert), alert.message),
    }));
    if let Some(token) = &settings.token {
        req = req.bearer_auth(token);
    }

    let resp = req.send().await?;
    if !resp.status().is_success() {
        return Err(ChannelError::WebhookStatus(resp.status().as_u16()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AlertCategory, Severity};
    use chrono::Utc;

    fn alert() -> Alert {
        Alert {
            id: 1,
            site_id: 1,
            category: AlertCategory::Down,
            severity: Severity::Critical,
            message: "5 consecutive failed checks".to_string(),
            acknowledged_by: None,
            acknowledged_at: None,
            created_at: Utc::now(),
        }
    }

    fn site() -> Site {
        Site {
            id: 1,
            name: "Example".to_string(),
            url: "https://example.com".to_string(),
            ..Site::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let channel = AlertChannel {
            id: 1,
            kind: "pager".to_string(),
            settings: "{}".to_string(),
            active: true,
        };
        let result = dispatch(&reqwest::Client::new(), &channel, &site(), &alert()).await;
        assert!(matches!(result, Err(ChannelError::UnknownKind(_))));
    }

    #[tokio::test]
    async fn test_bad_settings_rejected() {
        let channel = AlertChannel {
            id: 1,
            kind: "webhook".to_string(),
            settings: r#"{"no_url": true}"#.to_string(),
            active: true,
        };
        let result = dispatch(&reqwest::Client::new(), &channel, &site(), &alert()).await;
        assert!(matches!(result, Err(ChannelError::Settings(_))));
    }

    #[test]
    fn test_subject_format() {
        assert_eq!(subject(&site(), &alert()), "[CRITICAL] down: Example");
    }
}

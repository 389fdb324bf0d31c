// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - Dashboard Client
// Thin reqwest wrapper around the daemon's REST API and event stream

use std::time::Duration;

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use tunnel_dash_common::{HealthResponse, ScanResponse, Service, TunnelEvent, TunnelStatusResponse};

#[derive(Debug, Deserialize)]
pub struct TunnelCreated {
    pub remote_port: u16,
    pub local_port: u16,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct DashboardClient {
    client: Client,
    base_url: String,
}

impl DashboardClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fail with the daemon's `{"error": ...}` body on non-success statuses
    async fn checked(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<MessageBody>(&body) {
            Ok(MessageBody { error: Some(error), .. }) => anyhow::bail!("{} ({})", error, status),
            _ => anyhow::bail!("Dashboard returned {}: {}", status, body.trim()),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("Failed to reach dashboard at {}", self.base_url))?;

        self.checked(response)
            .await?
            .json()
            .await
            .context("Unexpected response from dashboard")
    }

    async fn post(&self, path: &str) -> Result<Response> {
        self.client
            .post(self.url(path))
            .send()
            .await
            .with_context(|| format!("Failed to reach dashboard at {}", self.base_url))
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.get_json("/health").await
    }

    pub async fn services(&self) -> Result<Vec<Service>> {
        self.get_json("/api/services").await
    }

    pub async fn tunnels(&self) -> Result<Vec<TunnelStatusResponse>> {
        self.get_json("/api/tunnels").await
    }

    pub async fn open_tunnel(&self, port: u16) -> Result<TunnelCreated> {
        let response = self.post(&format!("/api/tunnels/{}", port)).await?;
        self.checked(response)
            .await?
            .json()
            .await
            .context("Unexpected response from dashboard")
    }

    pub async fn close_tunnel(&self, port: u16) -> Result<String> {
        let response = self.post(&format!("/api/tunnels/{}/close", port)).await?;
        let body: MessageBody = self.checked(response).await?.json().await?;
        Ok(body
            .message
            .unwrap_or_else(|| format!("Tunnel for port {} closed", port)))
    }

    /// Scan errors come back as a body, not a failed call
    pub async fn scan(&self, range: &str) -> Result<ScanResponse> {
        let response = self
            .client
            .post(self.url("/api/scan"))
            .query(&[("range", range)])
            .send()
            .await
            .with_context(|| format!("Failed to reach dashboard at {}", self.base_url))?;

        response
            .json()
            .await
            .context("Unexpected response from dashboard")
    }

    /// Tunnel events as they arrive; ends when the daemon shuts down
    pub async fn events(&self) -> Result<impl Stream<Item = Result<TunnelEvent>>> {
        let response = self
            .client
            .get(self.url("/api/events"))
            .send()
            .await
            .context("Failed to connect to events stream")?;
        let response = self.checked(response).await?;

        let mut parser = SseParser::default();
        let events = response.bytes_stream().flat_map(move |chunk| {
            let parsed: Vec<Result<TunnelEvent>> = match chunk {
                Ok(bytes) => parser.push(&String::from_utf8_lossy(&bytes)),
                Err(e) => vec![Err(anyhow::Error::new(e).context("Error reading from event stream"))],
            };
            futures::stream::iter(parsed)
        });

        Ok(events)
    }
}

/// Incremental `text/event-stream` parser for `data:` lines
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    /// Feed a chunk and return every event completed by it
    pub fn push(&mut self, text: &str) -> Vec<Result<TunnelEvent>> {
        self.buffer.push_str(&text.replace("\r\n", "\n"));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let message: String = self.buffer.drain(..pos + 2).collect();

            for line in message.lines() {
                // Ignore comments / empty lines
                let Some(rest) = line.strip_prefix("data:") else {
                    continue;
                };
                let json = rest.trim();
                if json.is_empty() {
                    continue;
                }

                events.push(
                    serde_json::from_str::<TunnelEvent>(json)
                        .with_context(|| format!("Failed to parse event JSON: {}", json)),
                );
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = SseParser::default();

        assert!(parser.push("data: {\"type\":\"closed\",").is_empty());
        let events = parser.push("\"remote_port\":3000}\n\n");

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            TunnelEvent::Closed { remote_port: 3000 }
        ));
    }

    #[test]
    fn test_parser_multiple_events_and_comments() {
        let mut parser = SseParser::default();
        let events = parser.push(
            ": keep-alive\n\n\
             data: {\"type\":\"active\",\"remote_port\":80,\"local_port\":9000}\n\n\
             data: {\"type\":\"heartbeat\",\"timestamp\":\"2025-01-01T00:00:00Z\"}\r\n\r\n",
        );

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            TunnelEvent::Active { remote_port: 80, local_port: 9000 }
        ));
        assert!(matches!(events[1].as_ref().unwrap(), TunnelEvent::Heartbeat { .. }));
    }

    #[test]
    fn test_parser_reports_bad_json() {
        let mut parser = SseParser::default();
        let events = parser.push("data: not json\n\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }
}

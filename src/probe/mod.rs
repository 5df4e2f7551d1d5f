pub mod protocol;

use std::{net::SocketAddr, sync::LazyLock, time::Duration};

use azalea_chat::FormattedText;
use bson::{Bson, Document};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{config::Config, database::Database};

/// Application-layer probe: pings an open endpoint with the Server List
/// Ping exchange and owns the persistence of whatever comes back. The scan
/// engine only ever calls [`Pinger::check`]; failures stay in here.
pub struct Pinger {
    database: Database,
    protocol_version: i32,
    timeout: Duration,
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl Pinger {
    pub fn new(config: &Config, database: Database) -> Self {
        Self {
            database,
            protocol_version: config.probe.protocol_version,
            timeout: Duration::from_secs(config.probe.timeout_secs),
            webhook_url: (config.webhook.enabled && !config.webhook.url.is_empty())
                .then(|| config.webhook.url.clone()),
            http: reqwest::Client::new(),
        }
    }

    /// Probe one endpoint and upsert its catalog document. Dead or
    /// non-Minecraft endpoints are routine; everything here is logged and
    /// swallowed so one bad host never takes down a subnet.
    pub async fn check(&self, addr: SocketAddr) {
        if let Err(err) = self.check_inner(addr).await {
            debug!("Probe failed for {addr}: {err}");
        }
    }

    async fn check_inner(&self, addr: SocketAddr) -> eyre::Result<()> {
        let ping = protocol::ping(addr, self.protocol_version, self.timeout).await?;
        let Some(fields) = document_from_status(&ping.status, ping.latency_ms) else {
            debug!("{addr} answered the ping but doesn't look like a minecraft server");
            return Ok(());
        };
        let motd = fields
            .get_str("lastOnlineDescription")
            .unwrap_or_default()
            .to_string();

        let newly_discovered = self.database.upsert_server(addr, fields).await?;
        if newly_discovered {
            info!("Found server {addr}");
            if let Some(url) = &self.webhook_url {
                self.notify_webhook(url, addr, &motd).await;
            }
        }
        Ok(())
    }

    async fn notify_webhook(&self, url: &str, addr: SocketAddr, motd: &str) {
        let content = format!("Found server {addr}: {}", strip_color_codes(motd));
        let result = self
            .http
            .post(url)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await;
        if let Err(err) = result {
            error!("Failed to post webhook: {err}");
        }
    }
}

/// Turn a status response into the `$set` fields of a server document.
/// Returns None when there's no description at all, which means whatever
/// answered probably isn't a minecraft server.
pub fn document_from_status(status: &Value, latency_ms: u64) -> Option<Document> {
    let object = status.as_object()?;
    let description = object.get("description")?;
    let description = FormattedText::deserialize(description)
        .unwrap_or_default()
        .to_string();

    let mut fields = Document::new();
    fields.insert("lastOnlineDescription", description);
    fields.insert("lastOnlinePing", latency_ms as i64);

    if let Some(version) = object.get("version").and_then(Value::as_object) {
        if let Some(name) = version.get("name").and_then(Value::as_str) {
            fields.insert("lastOnlineVersion", name);
        }
        if let Some(protocol) = version.get("protocol").and_then(Value::as_i64) {
            fields.insert("lastOnlineVersionProtocol", protocol);
        }
    }

    if let Some(players) = object.get("players").and_then(Value::as_object) {
        if let Some(online) = players.get("online").and_then(Value::as_i64) {
            fields.insert("lastOnlinePlayers", online);
        }
        if let Some(max) = players.get("max").and_then(Value::as_i64) {
            fields.insert("lastOnlinePlayersMax", max);
        }
        if let Some(sample) = players.get("sample").and_then(Value::as_array) {
            let mut list = Vec::new();
            for player in sample {
                let Some(player) = player.as_object() else {
                    continue;
                };
                let name = player.get("name").and_then(Value::as_str).unwrap_or_default();
                let uuid = player.get("id").and_then(Value::as_str).unwrap_or_default();
                if name.is_empty() && uuid.is_empty() {
                    continue;
                }
                let mut entry = Document::new();
                entry.insert("name", name);
                entry.insert("uuid", uuid);
                list.push(Bson::Document(entry));
            }
            fields.insert("lastOnlinePlayersList", Bson::Array(list));
        }
    }

    if let Some(favicon) = object.get("favicon").and_then(Value::as_str) {
        fields.insert("favicon", favicon);
    }

    Some(fields)
}

/// Strip legacy `§` formatting codes, for webhook text where they'd just be
/// mojibake.
pub fn strip_color_codes(text: &str) -> String {
    static COLOR_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new("§[0-9a-fk-or]?").unwrap());
    COLOR_CODE.replace_all(text, "").trim().to_string()
}

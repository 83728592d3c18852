//! `chatrelay check-config`: validate the config without connecting.

use anyhow::Result;
use std::path::Path;

use crate::agent::AgentBridge;
use crate::config::Config;

pub fn run(path: &Path) -> Result<()> {
    let cfg = Config::load(path)?;
    let connect = cfg.connect_config()?;
    let crypto = cfg.crypto()?;
    let platform = cfg.platform()?;
    let agent = AgentBridge::new(&cfg.agent);

    println!("config:      {}", path.display());
    println!("gateway:     {}", connect.url);
    println!("http base:   {}", connect.http_base());
    println!("user:        {}", connect.user_id);
    println!("auth token:  {}", redact(&connect.auth_token));
    println!("heartbeat:   {}s", connect.heartbeat_interval.as_secs());
    println!(
        "raw mode:    {}",
        if crypto.is_some() { "can decrypt" } else { "not configured" }
    );
    let media = match (&platform, connect.proxy_media) {
        (Some(_), _) => "direct",
        (None, true) => "gateway proxy",
        (None, false) => "gateway proxy (fallback)",
    };
    println!("media:       {media}");
    println!("agent:       {}", agent.describe());
    Ok(())
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "(none)"
    } else {
        "(set)"
    }
}

//! Boot script for exit nodes.
//!
//! The script runs once on first boot: it installs the tunnel server binary
//! at a pinned version, writes the auth token to an environment file and
//! registers a systemd unit. Providers that require base64-encoded user
//! data (ec2) encode this string at the host-config layer.

use super::CONTROL_PORT;

const DOWNLOAD_URL: &str = "https://github.com/tunnel-operator/tunnel-server/releases/download";

pub fn make_exit_server_userdata(auth_token: &str, version: &str) -> String {
    format!(
        r#"#!/bin/bash
set -e

export AUTH_TOKEN="{auth_token}"

curl -SLsf {DOWNLOAD_URL}/{version}/tunnel-server -o /usr/local/bin/tunnel-server
chmod +x /usr/local/bin/tunnel-server

mkdir -p /etc/tunnel-server
echo "AUTH_TOKEN=$AUTH_TOKEN" > /etc/tunnel-server/env
chmod 600 /etc/tunnel-server/env

cat > /etc/systemd/system/tunnel-server.service <<UNIT
[Unit]
Description=Tunnel server
Wants=network-online.target
After=network-online.target
StartLimitIntervalSec=0

[Service]
Restart=always
RestartSec=1
User=root
EnvironmentFile=/etc/tunnel-server/env
ExecStart=/usr/local/bin/tunnel-server --port={port} --token-env AUTH_TOKEN

[Install]
WantedBy=multi-user.target
UNIT

systemctl daemon-reload
systemctl enable --now tunnel-server
"#,
        auth_token = auth_token,
        version = version,
        port = CONTROL_PORT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn userdata_embeds_token_and_version() {
        let script = make_exit_server_userdata("s3cret-token", "0.9.3");
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("AUTH_TOKEN=\"s3cret-token\""));
        assert!(script.contains("/0.9.3/tunnel-server"));
        assert!(script.contains("--port=8123"));
        assert!(script.contains("systemctl enable --now tunnel-server"));
    }

    #[test]
    fn userdata_is_deterministic() {
        assert_eq!(
            make_exit_server_userdata("t", "1.0.0"),
            make_exit_server_userdata("t", "1.0.0")
        );
    }
}

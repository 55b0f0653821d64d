use crate::classify::PAC_PATH;
use crate::config::ProxyConfig;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// Shared address space the overlay hands out to its nodes (100.64.0.0/10).
pub fn overlay_net() -> Ipv4Net {
    Ipv4Net::new_assert(Ipv4Addr::new(100, 64, 0, 0), 10)
}

/// MagicDNS suffix of overlay host names.
pub const OVERLAY_DOMAIN_SUFFIX: &str = ".ts.net";

/// Renders the two pages the proxy serves about itself. Everything is
/// computed from startup configuration, so the output never varies per request.
pub struct PageRenderer {
    status_page: String,
    pac_script: String,
}

impl PageRenderer {
    pub fn new(config: &ProxyConfig, program: &str) -> Self {
        Self {
            status_page: render_status_page(config, program),
            pac_script: render_pac_script(config),
        }
    }

    pub fn status_page(&self) -> &str {
        &self.status_page
    }

    pub fn pac_script(&self) -> &str {
        &self.pac_script
    }
}

/// Name the binary was invoked as, without its directory.
pub fn program_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .and_then(|arg0| std::path::Path::new(arg0).file_name())
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

pub fn render_pac_script(config: &ProxyConfig) -> String {
    format!(
        r#"function FindProxyForURL(url, host) {{
    if (dnsDomainIs(host, "{suffix}")) {{
        return "PROXY {listen}";
    }}
    if (isInNet(host, "{network}", "{netmask}")) {{
        return "PROXY {listen}";
    }}
    return "DIRECT";
}}
"#,
        suffix = OVERLAY_DOMAIN_SUFFIX,
        listen = config.listen_addr,
        network = overlay_net().network(),
        netmask = overlay_net().netmask(),
    )
}

pub fn render_status_page(config: &ProxyConfig, program: &str) -> String {
    let listen = config.listen_addr;
    let node = &config.node_name;
    let mut html = String::with_capacity(2048);

    html.push_str(r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>"#);
    html.push_str(node);
    html.push_str(r#" - overlay proxy</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif; margin: 40px; color: #333; }
        code, pre { background: #f4f4f4; padding: 2px 6px; border-radius: 4px; }
        pre { padding: 12px; }
        .node { color: #2980b9; }
    </style>
</head>
<body>
    <h1>Overlay proxy on <span class="node">"#);
    html.push_str(node);
    html.push_str(r#"</span></h1>
    <p>This proxy is listening on <code>"#);
    html.push_str(&listen.to_string());
    html.push_str(r#"</code> and reaches hosts on the overlay network through node <code>"#);
    html.push_str(node);
    html.push_str(r#"</code>.</p>

    <h2>Browser</h2>
    <p>Point automatic proxy configuration at <a href=""#);
    html.push_str(PAC_PATH);
    html.push_str(r#""><code>http://"#);
    html.push_str(&listen.to_string());
    html.push_str(PAC_PATH);
    html.push_str(r#"</code></a>. Only overlay addresses ("#);
    html.push_str(&overlay_net().to_string());
    html.push_str(r#" and <code>*"#);
    html.push_str(OVERLAY_DOMAIN_SUFFIX);
    html.push_str(r#"</code>) go through the proxy, everything else connects directly.</p>

    <h2>Command line</h2>
    <pre>curl -x http://"#);
    html.push_str(&listen.to_string());
    html.push_str(r#" http://my-host"#);
    html.push_str(OVERLAY_DOMAIN_SUFFIX);
    html.push_str(r#"/
export HTTPS_PROXY=http://"#);
    html.push_str(&listen.to_string());
    html.push_str(r#"</pre>

    <p style="color: #999; font-size: 0.8em;">Started as <code>"#);
    html.push_str(program);
    html.push_str(r#" --listen "#);
    html.push_str(&listen.to_string());
    html.push_str(r#" --name "#);
    html.push_str(node);
    html.push_str(r#"</code></p>
</body>
</html>"#);

    html
}

//! Rendering of the managed server configuration
//!
//! Pure functions from the proxy configuration view to the text the web
//! server consumes. Rendering is deterministic: the same view always
//! produces byte-identical output.

use std::fmt::Write;
use std::path::PathBuf;

/// Web server flavors the daemon can manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServerType {
    Nginx,
    Apache,
}

impl ServerType {
    pub fn default_file(self) -> PathBuf {
        match self {
            ServerType::Nginx => PathBuf::from("/etc/nginx/sites-enabled/cloudanchor.conf"),
            ServerType::Apache => PathBuf::from("/etc/apache2/sites-enabled/cloudanchor.conf"),
        }
    }

    pub fn default_pidfile(self) -> PathBuf {
        match self {
            ServerType::Nginx => PathBuf::from("/var/run/nginx.pid"),
            ServerType::Apache => PathBuf::from("/var/run/apache2/apache2.pid"),
        }
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerType::Nginx => f.write_str("nginx"),
            ServerType::Apache => f.write_str("apache"),
        }
    }
}

/// One virtual host entry: a (container, domain) pair plus the paths and
/// flags needed to render it.
#[derive(Debug, Clone)]
pub struct VirtualHost {
    pub name: String,
    pub addr: String,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub auth_addr: String,
    pub enable_tls: bool,
}

pub fn render(server: ServerType, hosts: &[VirtualHost]) -> String {
    match server {
        ServerType::Nginx => render_nginx(hosts),
        ServerType::Apache => render_apache(hosts),
    }
}

fn render_nginx(hosts: &[VirtualHost]) -> String {
    let mut out = String::from(
        "\
# AUTO GENERATED FILE

map $http_upgrade $connection_upgrade {
    default upgrade;
    ''      close;
}
",
    );
    for host in hosts {
        let _ = write!(
            out,
            "
# {name}
server {{
    listen 80;
    listen [::]:80;
    server_name {name};

",
            name = host.name,
        );
        if host.enable_tls {
            let _ = write!(
                out,
                "    location / {{
        return 301 https://{name}$request_uri;
    }}
}}

server {{
    listen 443 ssl;
    listen [::]:443;
    server_name {name};

    location / {{
        proxy_pass http://{addr};
        proxy_http_version 1.1;
        proxy_set_header Host              $host;
        proxy_set_header X-Real-IP         $remote_addr;
        proxy_set_header X-Forwarded-For   $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto https;
        proxy_set_header Upgrade           $http_upgrade;
        proxy_set_header Connection        $connection_upgrade;
    }}

    ssl_certificate {cert};
    ssl_certificate_key {key};
}}
",
                name = host.name,
                addr = host.addr,
                cert = host.cert_path.display(),
                key = host.key_path.display(),
            );
        } else {
            let _ = write!(
                out,
                "    location /.well-known/ {{
        proxy_pass http://{auth_addr};
    }}
}}
",
                auth_addr = host.auth_addr,
            );
        }
    }
    out
}

fn render_apache(hosts: &[VirtualHost]) -> String {
    let mut out = String::from("# AUTO GENERATED FILE\n");
    for host in hosts {
        let _ = write!(
            out,
            "
<VirtualHost *:80>
    ServerName {name}
",
            name = host.name,
        );
        if host.enable_tls {
            let _ = write!(
                out,
                "    Redirect permanent / https://{name}/
</VirtualHost>

<VirtualHost *:443>
    ServerName {name}

    ProxyPreserveHost On
    ProxyPass / http://{addr}/

    SSLEngine On
    SSLCertificateFile {cert}
    SSLCertificateKeyFile {key}
</VirtualHost>
",
                name = host.name,
                addr = host.addr,
                cert = host.cert_path.display(),
                key = host.key_path.display(),
            );
        } else {
            let _ = write!(
                out,
                "    ProxyPreserveHost On
    ProxyPass /.well-known/ http://{auth_addr}/.well-known/
</VirtualHost>
",
                auth_addr = host.auth_addr,
            );
        }
    }
    out
}

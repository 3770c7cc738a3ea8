use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Label reported for ports with no catalog entry.
pub const UNKNOWN_SERVICE: &str = "Unknown";

/// Well-known TCP ports and the service usually found on them.
const BUILTIN: &[(u16, &str)] = &[
    (20, "FTP"),
    (21, "FTP"),
    (22, "SSH"),
    (23, "Telnet"),
    (25, "SMTP"),
    (53, "DNS"),
    (67, "DHCP"),
    (68, "DHCP"),
    (69, "TFTP"),
    (80, "HTTP"),
    (110, "POP3"),
    (119, "NNTP"),
    (123, "NTP"),
    (137, "NetBIOS"),
    (138, "NetBIOS"),
    (139, "NetBIOS"),
    (143, "IMAP"),
    (161, "SNMP"),
    (162, "SNMP"),
    (179, "BGP"),
    (194, "IRC"),
    (389, "LDAP"),
    (443, "HTTPS"),
    (445, "SMB"),
    (465, "SMTPS"),
    (514, "Syslog"),
    (515, "LPD"),
    (520, "RIP"),
    (587, "SMTP Submission"),
    (631, "IPP"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (1080, "SOCKS"),
    (1194, "OpenVPN"),
    (1433, "MSSQL"),
    (1434, "MSSQL Monitor"),
    (1521, "Oracle"),
    (1723, "PPTP"),
    (1900, "SSDP, UPnP"),
    (2049, "NFS"),
    (2082, "cPanel"),
    (2083, "cPanel"),
    (3128, "Squid"),
    (3260, "iSCSI"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (3690, "Subversion"),
    (4369, "Erlang Port Mapper"),
    (5432, "PostgreSQL"),
    (5900, "VNC"),
    (5984, "CouchDB"),
    (6379, "Redis"),
    (6667, "IRC"),
    (8000, "Web Servers"),
    (8001, "Web Servers"),
    (8002, "Web Servers"),
    (8080, "HTTP Proxy"),
    (8086, "InfluxDB"),
    (8443, "HTTPS Alt"),
    (8888, "HTTP Alt"),
    (9200, "Elasticsearch"),
    (11211, "Memcached"),
    (27017, "MongoDB"),
    (32400, "Plex Media Server"),
    (37777, "Dahua DVR"),
    (44818, "EtherNet/IP"),
    (47808, "BACnet"),
    (50000, "Synology DSM"),
    (50070, "Hadoop NameNode"),
    (60000, "BitTorrent"),
];

static GLOBAL: Lazy<ServiceCatalog> = Lazy::new(ServiceCatalog::builtin);

/// Immutable port -> service label mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    labels: HashMap<u16, String>,
}

impl ServiceCatalog {
    /// Catalog with no entries; every lookup yields [`UNKNOWN_SERVICE`].
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self {
            labels: BUILTIN
                .iter()
                .map(|&(port, label)| (port, label.to_string()))
                .collect(),
        }
    }

    /// Process-wide built-in catalog, built on first use.
    pub fn global() -> &'static ServiceCatalog {
        &GLOBAL
    }

    /// Parse an external service table.
    ///
    /// Supported formats per line:
    /// - `22 SSH` or `22=SSH`; the label is the rest of the line and may contain spaces
    /// - comments: everything after `#` is ignored
    /// - whitespace and blank lines are ignored
    ///
    /// Malformed lines are logged and skipped. A later line for the same port replaces
    /// an earlier one.
    pub fn parse_str(s: &str) -> Self {
        let mut labels = HashMap::new();

        for (idx, raw_line) in s.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
            if line.is_empty() {
                continue;
            }

            let Some((port, label)) = line.split_once(|c: char| c.is_whitespace() || c == '=')
            else {
                warn!(line = line_no, "service entry has no label: {line}");
                continue;
            };
            let port = match port.trim().parse::<u16>() {
                Ok(p) => p,
                Err(e) => {
                    warn!(line = line_no, "invalid port in service entry {line:?}: {e}");
                    continue;
                }
            };
            let label = label.trim().trim_start_matches('=').trim();
            if label.is_empty() {
                warn!(line = line_no, port, "service entry has an empty label");
                continue;
            }
            labels.insert(port, label.to_string());
        }

        Self { labels }
    }

    /// Load a service table from a file. An unreadable file is logged and yields an
    /// empty catalog instead of an error.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::parse_str(&content),
            Err(e) => {
                warn!("failed to read service table {}: {e}", path.display());
                Self::empty()
            }
        }
    }

    /// Return this catalog with `port` mapped to `label`.
    pub fn with_entry(mut self, port: u16, label: impl Into<String>) -> Self {
        self.labels.insert(port, label.into());
        self
    }

    pub fn lookup(&self, port: u16) -> &str {
        self.labels
            .get(&port)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_SERVICE)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

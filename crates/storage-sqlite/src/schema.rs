pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE ip_history (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  ip            TEXT NOT NULL,
  asn           TEXT,
  isp           TEXT,
  country       TEXT,
  city          TEXT,
  timestamp_ms  INTEGER NOT NULL
);

CREATE TABLE traces (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  target        TEXT NOT NULL,
  timestamp_ms  INTEGER NOT NULL
);

CREATE TABLE trace_hops (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  trace_id      INTEGER NOT NULL REFERENCES traces(id) ON DELETE CASCADE,
  hop_num       INTEGER NOT NULL,
  ip            TEXT,
  hostname      TEXT,
  latency_ms    REAL,
  lost          INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE scan_hosts (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  ip            TEXT NOT NULL UNIQUE,
  hostname      TEXT,
  alive         INTEGER NOT NULL DEFAULT 0,
  latency_ms    REAL,
  last_seen_ms  INTEGER NOT NULL,
  display_name  TEXT,
  tags          TEXT,
  icon          TEXT
);

CREATE TABLE scan_ports (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  host_id       INTEGER NOT NULL REFERENCES scan_hosts(id) ON DELETE CASCADE,
  port          INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
  protocol      TEXT NOT NULL DEFAULT 'tcp',
  service       TEXT,
  state         TEXT NOT NULL DEFAULT 'open',
  banner        TEXT,
  last_seen_ms  INTEGER NOT NULL,
  UNIQUE (host_id, port, protocol)
);

CREATE TABLE dns_targets (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  name          TEXT NOT NULL,
  resolver_ip   TEXT,
  doh_url       TEXT
);

CREATE TABLE dns_metrics (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  server        TEXT NOT NULL,
  protocol      TEXT NOT NULL CHECK (protocol IN ('udp','doh')),
  resolved_ip   TEXT,
  latency_ms    INTEGER NOT NULL,
  timestamp_ms  INTEGER NOT NULL
);

CREATE INDEX idx_ip_history_time ON ip_history(timestamp_ms);
CREATE INDEX idx_traces_target ON traces(target, timestamp_ms);
CREATE INDEX idx_trace_hops_trace ON trace_hops(trace_id);
CREATE INDEX idx_scan_hosts_alive ON scan_hosts(alive);
CREATE INDEX idx_scan_ports_host ON scan_ports(host_id);
CREATE INDEX idx_dns_metrics_server ON dns_metrics(server, timestamp_ms);

COMMIT;
"#;

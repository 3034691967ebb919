//! Parsers for the two `lsof` output shapes we consume: the columnar
//! listener table and the `-F` field format.

use std::collections::HashSet;

use super::DiscoveredProcess;

/// Parse `lsof -nP -iTCP -sTCP:LISTEN` output.
///
/// Rows look like
/// `node  4242 dev  23u  IPv6 0x1  0t0  TCP *:3000 (LISTEN)`.
/// The header and anything malformed are skipped; `(pid, port)` duplicates
/// (IPv4 + IPv6 sockets of one server) collapse to the first row.
pub fn parse_listeners(output: &str) -> Vec<DiscoveredProcess> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for line in output.lines().skip(1) {
        let Some(record) = parse_listener_row(line) else {
            continue;
        };
        if seen.insert((record.pid, record.port)) {
            records.push(record);
        }
    }
    records
}

fn parse_listener_row(line: &str) -> Option<DiscoveredProcess> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }

    let pid: u32 = fields[1].parse().ok()?;
    let port = extract_port(fields[8])?;

    Some(DiscoveredProcess {
        pid,
        ppid: None,
        user: Some(fields[2].to_string()),
        command: fields[0].to_string(),
        port,
        protocol: fields[7].to_lowercase(),
        cwd: None,
        project_root: None,
        agent_tag: None,
    })
}

/// Port is whatever follows the last `:` of the NAME column
/// (`*:3000`, `127.0.0.1:8080`, `[::1]:5173`).
fn extract_port(name: &str) -> Option<u16> {
    let (_, port) = name.rsplit_once(':')?;
    port.parse().ok()
}

/// Values of the `n` (name) field from `lsof -F n` output, in order.
pub fn parse_name_fields(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix('n'))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
COMMAND     PID USER   FD   TYPE             DEVICE SIZE/OFF NODE NAME
node      4242  dev   23u  IPv4 0xabc1                0t0  TCP *:3000 (LISTEN)
node      4242  dev   24u  IPv6 0xabc2                0t0  TCP *:3000 (LISTEN)
python3   5151  dev    5u  IPv4 0xabc3                0t0  TCP 127.0.0.1:8000 (LISTEN)
vite      6161  dev   30u  IPv6 0xabc4                0t0  TCP [::1]:5173 (LISTEN)
garbage line
postgres   777  pg     7u  IPv4 0xabc5                0t0  TCP 127.0.0.1:notaport (LISTEN)
";

    #[test]
    fn test_parse_listeners_dedups_and_skips_bad_rows() {
        let records = parse_listeners(SAMPLE);
        let keys: Vec<(u32, u16)> = records.iter().map(|r| (r.pid, r.port)).collect();
        assert_eq!(keys, vec![(4242, 3000), (5151, 8000), (6161, 5173)]);
    }

    #[test]
    fn test_parse_listener_fields() {
        let records = parse_listeners(SAMPLE);
        let node = &records[0];
        assert_eq!(node.command, "node");
        assert_eq!(node.user.as_deref(), Some("dev"));
        assert_eq!(node.protocol, "tcp");
        assert!(node.cwd.is_none());
    }

    #[test]
    fn test_same_pid_multiple_ports_kept() {
        let output = "\
COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME
java    900 dev  10u IPv4 0x1 0t0 TCP *:8080 (LISTEN)
java    900 dev  11u IPv4 0x2 0t0 TCP *:8443 (LISTEN)
";
        assert_eq!(parse_listeners(output).len(), 2);
    }

    #[test]
    fn test_header_only() {
        assert!(parse_listeners("COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME\n").is_empty());
        assert!(parse_listeners("").is_empty());
    }

    #[test]
    fn test_extract_port() {
        assert_eq!(extract_port("*:3000"), Some(3000));
        assert_eq!(extract_port("[::1]:5173"), Some(5173));
        assert_eq!(extract_port("localhost"), None);
        assert_eq!(extract_port("*:99999"), None);
    }

    #[test]
    fn test_parse_name_fields() {
        let output = "p4242\nfcwd\nn/Users/dev/project\n";
        assert_eq!(parse_name_fields(output), vec!["/Users/dev/project".to_string()]);

        let files = "p1\nf1\nn/dev/null\nf5\nn/tmp/app.log\nf6\nn\n";
        assert_eq!(parse_name_fields(files), vec!["/dev/null", "/tmp/app.log"]);
    }
}

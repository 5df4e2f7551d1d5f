use std::{
    net::{IpAddr, SocketAddr},
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EndpointHook, ScanOptions};

/// How long a child gets between SIGTERM and SIGKILL.
const SIGTERM_GRACE: Duration = Duration::from_secs(10);

/// One `open` observation from the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEndpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub proto: String,
}

impl OpenEndpoint {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn is_tcp(&self) -> bool {
        self.proto == "tcp"
    }
}

/// Run the external scanner over one subnet and collect its open endpoints.
///
/// Scanner problems are never fatal to the scan: a missing binary or a child
/// that dies mid-subnet yields whatever was collected so far and the pool
/// moves on. Cancellation SIGTERMs the child; lines it emits while dying are
/// still processed.
pub async fn scan_subnet(
    cidr: &str,
    options: &ScanOptions,
    cancel: &CancellationToken,
    on_endpoint: Option<&EndpointHook>,
) -> Vec<OpenEndpoint> {
    if cancel.is_cancelled() {
        return Vec::new();
    }
    if options.live_output {
        scan_live(cidr, options, cancel, on_endpoint).await
    } else {
        scan_batch(cidr, options, cancel).await
    }
}

/// Batch mode: wait for the child to exit, then parse everything it wrote.
/// A cancellation mid-flight discards the subnet.
async fn scan_batch(cidr: &str, options: &ScanOptions, cancel: &CancellationToken) -> Vec<OpenEndpoint> {
    let Some(mut child) = spawn_scanner(cidr, options) else {
        return Vec::new();
    };
    let Some(stdout) = child.stdout.take() else {
        error!("No stdout handle for masscan child scanning {cidr}");
        send_sigterm(&child);
        wait_for_exit(&mut child, cidr).await;
        return Vec::new();
    };

    info!("Masscan start (batch): {cidr}");
    let mut output = String::new();
    let mut reader = BufReader::new(stdout);
    tokio::select! {
        _ = cancel.cancelled() => {
            send_sigterm(&child);
            wait_for_exit(&mut child, cidr).await;
            info!("Masscan cancelled (batch): {cidr}");
            return Vec::new();
        }
        read = reader.read_to_string(&mut output) => {
            if let Err(err) = read {
                warn!("Error reading masscan output for {cidr}: {err}");
            }
        }
    }
    wait_for_exit(&mut child, cidr).await;

    let endpoints: Vec<OpenEndpoint> = output.lines().filter_map(parse_open_line).collect();
    info!("Masscan complete (batch): {cidr} (open endpoints {})", endpoints.len());
    endpoints
}

/// Live mode: parse lines as they arrive so a counter can tick per endpoint
/// and cancellation is observed between lines.
async fn scan_live(
    cidr: &str,
    options: &ScanOptions,
    cancel: &CancellationToken,
    on_endpoint: Option<&EndpointHook>,
) -> Vec<OpenEndpoint> {
    let Some(mut child) = spawn_scanner(cidr, options) else {
        return Vec::new();
    };
    let Some(stdout) = child.stdout.take() else {
        error!("No stdout handle for masscan child scanning {cidr}");
        send_sigterm(&child);
        wait_for_exit(&mut child, cidr).await;
        return Vec::new();
    };

    info!("Masscan start (live): {cidr}");
    let mut endpoints = Vec::new();
    let mut lines = BufReader::new(stdout).lines();
    let mut stopping = false;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled(), if !stopping => {
                // ask the child to stop, then keep draining whatever it
                // still has buffered
                stopping = true;
                send_sigterm(&child);
                continue;
            }
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if let Some(endpoint) = parse_open_line(&line) {
                    if let Some(hook) = on_endpoint {
                        hook(&endpoint);
                    }
                    endpoints.push(endpoint);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("Error reading masscan output for {cidr}: {err}");
                break;
            }
        }
    }
    wait_for_exit(&mut child, cidr).await;

    info!("Masscan complete (live): {cidr} (open endpoints {})", endpoints.len());
    endpoints
}

fn spawn_scanner(cidr: &str, options: &ScanOptions) -> Option<Child> {
    let mut command = Command::new(&options.masscan_path);
    command
        .arg(cidr)
        .arg("-p")
        .arg(format!("{}-{}", options.port_start, options.port_end))
        .arg("--max-rate")
        .arg(options.rate.to_string())
        .arg("--output-format")
        .arg("list")
        .arg("--output-filename")
        .arg("-")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!("Masscan not found at {:?}; skipping {cidr}", options.masscan_path);
            return None;
        }
        Err(err) => {
            error!("Failed to start masscan for {cidr}: {err}");
            return None;
        }
    };

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("masscan stderr: {line}");
            }
        });
    }

    Some(child)
}

fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    }
}

/// Wait for the child, escalating to SIGKILL if it outstays the grace
/// period. The exit code is logged, never propagated: masscan exits
/// non-zero on SIGTERM as a matter of course.
async fn wait_for_exit(child: &mut Child, cidr: &str) {
    match tokio::time::timeout(SIGTERM_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            info!("Masscan exited for {cidr}: {status}");
        }
        Ok(Err(err)) => {
            warn!("Failed waiting for masscan child for {cidr}: {err}");
        }
        Err(_) => {
            warn!("Masscan for {cidr} ignored SIGTERM; killing");
            if let Err(err) = child.kill().await {
                error!("Failed to kill masscan child for {cidr}: {err}");
            }
        }
    }
}

/// `open <proto> <port> <ip> [timestamp]` — anything else is noise.
fn parse_open_line(line: &str) -> Option<OpenEndpoint> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "open" {
        return None;
    }
    let proto = parts.next()?.to_string();
    let port = parts.next()?.parse().ok()?;
    let ip = parts.next()?.parse().ok()?;
    Some(OpenEndpoint { ip, port, proto })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_open_line_with_timestamp() {
        let endpoint = parse_open_line("open tcp 25565 192.0.2.1 1700000000").unwrap();
        assert_eq!(endpoint.ip, "192.0.2.1".parse::<IpAddr>().unwrap());
        assert_eq!(endpoint.port, 25565);
        assert!(endpoint.is_tcp());
        assert_eq!(endpoint.addr().to_string(), "192.0.2.1:25565");
    }

    #[test]
    fn test_parse_open_line_without_timestamp() {
        let endpoint = parse_open_line("open tcp 25577 198.51.100.9").unwrap();
        assert_eq!(endpoint.port, 25577);
    }

    #[test]
    fn test_parse_rejects_noise() {
        assert_eq!(parse_open_line(""), None);
        assert_eq!(parse_open_line("#masscan"), None);
        assert_eq!(parse_open_line("banner tcp 25565 192.0.2.1"), None);
        assert_eq!(parse_open_line("open tcp notaport 192.0.2.1"), None);
        assert_eq!(parse_open_line("open tcp 25565 notanip"), None);
        assert_eq!(parse_open_line("open tcp 25565"), None);
    }

    #[test]
    fn test_parse_v6_endpoint() {
        let endpoint = parse_open_line("open tcp 25565 2001:db8::1 1700000000").unwrap();
        assert_eq!(endpoint.addr().to_string(), "[2001:db8::1]:25565");
    }

    fn fake_scanner(name: &str, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("copescan-test-{}-{name}", std::process::id()));
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn options_with_scanner(path: String, live_output: bool) -> ScanOptions {
        ScanOptions {
            max_active: 2,
            rate: 100.0,
            port_start: 25565,
            port_end: 25577,
            masscan_path: path,
            live_output,
        }
    }

    #[tokio::test]
    async fn test_live_scan_streams_endpoints() {
        let script = "#!/bin/sh\n\
            echo '#masscan'\n\
            echo 'open tcp 25565 192.0.2.1 1700000000'\n\
            echo 'open tcp 25566 192.0.2.2 1700000001'\n\
            echo 'not an open line'\n";
        let options = options_with_scanner(fake_scanner("live", script), true);
        let cancel = CancellationToken::new();

        let endpoints = scan_subnet("192.0.2.0/24", &options, &cancel, None).await;
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].port, 25565);
        assert_eq!(endpoints[1].addr().to_string(), "192.0.2.2:25566");
    }

    #[tokio::test]
    async fn test_batch_scan_collects_after_exit() {
        let script = "#!/bin/sh\n\
            echo 'open tcp 25565 192.0.2.7 1700000000'\n";
        let options = options_with_scanner(fake_scanner("batch", script), false);
        let cancel = CancellationToken::new();

        let endpoints = scan_subnet("192.0.2.0/24", &options, &cancel, None).await;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].addr().to_string(), "192.0.2.7:25565");
    }

    #[tokio::test]
    async fn test_missing_scanner_yields_empty() {
        let options = options_with_scanner("/nonexistent/masscan-for-tests".to_string(), true);
        let cancel = CancellationToken::new();

        let endpoints = scan_subnet("192.0.2.0/24", &options, &cancel, None).await;
        assert!(endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_spawn_scans_nothing() {
        let options = options_with_scanner("/nonexistent/masscan-for-tests".to_string(), false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let endpoints = scan_subnet("192.0.2.0/24", &options, &cancel, None).await;
        assert!(endpoints.is_empty());
    }
}

// =============================================================================
// runner/subprocess.rs — ONE SCRAPE, ONE PROCESS, ONE DEADLINE
// =============================================================================
//
// Each scrape attempt runs as its own `scrape <MC>` child process so a
// wedged Chrome can be taken out back without touching the server.
//
// Termination is two-stage: close the child's stdin (the scrape subcommand,
// started with --stdin-shutdown, treats EOF as "please wrap it up" and
// tears its browser down), give it the grace period, then SIGKILL the
// child's whole process group and reap. The scraper leads its own group, so
// Chrome and its helpers go down with it even though a SIGKILLed scraper
// never gets to close its browser.
// =============================================================================

use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::ScrapeOutcome;

use super::RunnerError;

/// How to start a scraper process. The MC number is appended as the last
/// argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScraperCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ScraperCommand {
    /// `SCRAPER_PROGRAM` when configured, otherwise this very binary in
    /// `scrape` mode, listening for stdin EOF as its stop request.
    pub fn from_config(config: &Config) -> Result<Self, RunnerError> {
        let program = match &config.scraper_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(RunnerError::Spawn)?,
        };
        Ok(Self {
            program,
            args: vec!["scrape".to_string(), "--stdin-shutdown".to_string()],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited on its own; this is what it printed.
    Completed(ScrapeOutcome),
    /// The deadline passed and the process was stopped.
    TimedOut { pid: Option<u32>, killed: bool },
}

pub async fn run_scraper(
    command: &ScraperCommand,
    mc_number: &str,
    deadline: Duration,
    grace: Duration,
) -> Result<RunOutcome, RunnerError> {
    let mut process = Command::new(&command.program);
    process
        .args(&command.args)
        .arg(mc_number)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(unix)]
    process.process_group(0);
    let mut child = process.spawn().map_err(RunnerError::Spawn)?;

    let pid = child.id();
    let mut group = ProcessGroup { pgid: pid };
    debug!(mc_number = mc_number, pid = ?pid, deadline_secs = deadline.as_secs(), "Scraper process started");

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunnerError::Spawn(std::io::Error::other("scraper stdout was not captured")))?;
    let mut output = Vec::new();

    let finished = tokio::time::timeout(deadline, async {
        stdout.read_to_end(&mut output).await?;
        child.wait().await
    })
    .await;

    match finished {
        Ok(Ok(status)) => {
            group.release();
            let outcome = parse_output(&output, status.success(), &status.to_string());
            info!(
                mc_number = mc_number,
                pid = ?pid,
                exit = %status,
                usable = outcome.is_usable(),
                "Scraper process finished"
            );
            Ok(RunOutcome::Completed(outcome))
        }
        Ok(Err(e)) => {
            terminate(&mut child, &mut group, grace).await;
            Err(RunnerError::Io(e))
        }
        Err(_) => {
            warn!(mc_number = mc_number, pid = ?pid, deadline_secs = deadline.as_secs(), "Scraper missed its deadline, stopping it");
            let killed = terminate(&mut child, &mut group, grace).await;
            Ok(RunOutcome::TimedOut { pid, killed })
        }
    }
}

/// The scraper's process group. Dropping it SIGKILLs whatever is still in
/// the group, which covers a scrape future dropped mid-run.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }

    /// The scraper exited on its own and cleaned up after itself.
    fn release(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        warn!(pgid = pgid, "Scraper process group id out of range");
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        // Nothing left in the group.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pgid, error = %e, "Failed to kill scraper process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Ask politely, then insist. Returns true when the process had to be killed.
/// Anything the scraper started is swept up either way.
async fn terminate(child: &mut Child, group: &mut ProcessGroup, grace: Duration) -> bool {
    drop(child.stdin.take());

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit = %status, "Scraper stopped after stdin closed");
            group.kill();
            false
        }
        _ => {
            group.kill();
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill scraper process");
            }
            true
        }
    }
}

/// Scrape logs go to stderr, so stdout should be a single JSON document.
/// The last non-blank line is taken in case anything else slipped through.
fn parse_output(output: &[u8], exited_ok: bool, exit: &str) -> ScrapeOutcome {
    let text = String::from_utf8_lossy(output);
    let line = match text.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(line) => line,
        None if exited_ok => return ScrapeOutcome::Failed("scraper printed nothing".to_string()),
        None => return ScrapeOutcome::Failed(format!("scraper exited with {}", exit)),
    };
    match serde_json::from_str::<Value>(line) {
        Ok(value) => ScrapeOutcome::from_json(&value),
        Err(e) => ScrapeOutcome::Failed(format!("invalid scraper output: {}", e)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ScraperCommand;

    /// `sh -c <script>` with the MC number arriving as `$1`.
    pub fn shell(script: &str) -> ScraperCommand {
        ScraperCommand {
            program: "sh".into(),
            args: vec!["-c".to_string(), script.to_string(), "scrape".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::shell;
    use super::*;
    use std::path::Path;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_completed_scrape_is_parsed() {
        let cmd = shell(r#"echo "[{\"type\":\"Cargo\",\"insurance_carrier\":\"MC $1\"}]""#);
        let outcome = run_scraper(&cmd, "123456", Duration::from_secs(5), Duration::from_millis(200))
            .await
            .unwrap();
        match outcome {
            RunOutcome::Completed(ScrapeOutcome::Found(items)) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].kind, "Cargo");
                assert_eq!(items[0].insurance_carrier, "MC 123456");
            }
            other => panic!("expected line items, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_list_is_a_failed_outcome() {
        let cmd = shell(r#"echo '[{"error":"Unexpected error: solve_captcha: boom"}]'"#);
        let outcome = run_scraper(&cmd, "1", Duration::from_secs(5), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed(ScrapeOutcome::Failed("Unexpected error: solve_captcha: boom".into()))
        );
    }

    #[tokio::test]
    async fn test_crash_without_output_is_a_failed_outcome() {
        let outcome = run_scraper(&shell("exit 3"), "1", Duration::from_secs(5), Duration::from_millis(200))
            .await
            .unwrap();
        match outcome {
            RunOutcome::Completed(ScrapeOutcome::Failed(msg)) => assert!(msg.contains("exit")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_kills_a_stuck_scraper() {
        let started = Instant::now();
        let outcome = run_scraper(&shell("exec sleep 30"), "1", Duration::from_millis(300), Duration::from_millis(200))
            .await
            .unwrap();

        let (pid, killed) = match outcome {
            RunOutcome::TimedOut { pid, killed } => (pid, killed),
            other => panic!("expected timeout, got {:?}", other),
        };
        assert!(killed);
        assert!(started.elapsed() < Duration::from_secs(5));
        let pid = pid.unwrap();
        assert!(!Path::new(&format!("/proc/{}", pid)).exists(), "scraper process {} leaked", pid);
    }

    /// Alive and not a zombie.
    fn running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_deadline_kills_the_whole_process_tree() {
        // The grandchild stands in for the Chrome a real scrape launches.
        let pid_file = std::env::temp_dir().join(format!("scraper-tree-{}.pid", uuid::Uuid::new_v4()));
        let script = r#"sleep 30 & echo $! > "$1"; wait"#;
        let outcome = run_scraper(&shell(script), pid_file.to_str().unwrap(), Duration::from_millis(300), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::TimedOut { killed: true, .. }));

        let grandchild: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let _ = std::fs::remove_file(&pid_file);
        let deadline = Instant::now() + Duration::from_secs(2);
        while running(grandchild) {
            assert!(Instant::now() < deadline, "grandchild {} outlived the scraper", grandchild);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_default_command_asks_for_stdin_shutdown() {
        let command = ScraperCommand::from_config(&Config::for_tests()).unwrap();
        assert_eq!(command.args, ["scrape", "--stdin-shutdown"]);
    }

    #[tokio::test]
    async fn test_closing_stdin_stops_a_cooperative_scraper() {
        // Exits as soon as stdin hits EOF, well inside the grace period.
        let started = Instant::now();
        let outcome = run_scraper(&shell("read _line; exit 0"), "1", Duration::from_millis(200), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::TimedOut { killed: false, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_parse_output_takes_last_line() {
        let out = b"noise\n[{\"type\":\"No Insurance on file\",\"policy_surety_number\":\"No Insurance on file\"}]\n";
        assert_eq!(parse_output(out, true, "exit status: 0"), ScrapeOutcome::NoInsuranceOnFile);
        assert!(!parse_output(b"", true, "exit status: 0").is_usable());
    }
}

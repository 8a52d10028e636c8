use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDateTime};
use tokio::process::Command;

use crate::config::{LsfConfig, MemoryUnit, ResourceLimits};
use crate::driver::{run_command, ExternalHandle, SchedulerDriver};
use crate::error::{BatchError, Result};
use crate::scheduler::JobId;

/// What `bjobs -l` tells us about a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BjobsVerdict {
    Finished(i32),
    Pending,
    /// bjobs no longer knows the job; ask bacct.
    Unknown,
}

/// Driver for IBM Spectrum LSF (`bsub`, `bjobs`, `bacct`, `bkill`).
#[derive(Debug, Clone, Default)]
pub struct LsfDriver {
    config: LsfConfig,
}

impl LsfDriver {
    pub fn new(config: LsfConfig) -> Self {
        Self { config }
    }

    fn memory_in_unit(&self, cores: f64, memory: u64) -> u64 {
        let mut mem = memory as f64 / self.config.memory_unit.bytes() as f64;
        if self.config.per_core_reservation {
            mem /= cores.ceil().max(1.0);
        }
        mem.ceil().max(1.0) as u64
    }
}

#[async_trait]
impl SchedulerDriver for LsfDriver {
    fn name(&self) -> &str {
        "lsf"
    }

    fn format_submission(
        &self,
        cores: f64,
        memory: u64,
        job_id: JobId,
        command: &str,
    ) -> Vec<String> {
        let mut line: Vec<String> = ["bsub", "-cwd", ".", "-o", "/dev/null", "-e", "/dev/null", "-J"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        line.push(format!("{}{}", self.config.job_name_prefix, job_id));

        if memory > 0 {
            let mem = self.memory_in_unit(cores, memory);
            line.push("-R".to_string());
            line.push(format!("select[type==X86_64] rusage[mem={mem}]"));
            line.push("-M".to_string());
            line.push(mem.to_string());
        }

        line.push("-n".to_string());
        line.push((cores.ceil().max(1.0) as u64).to_string());
        line.extend(self.config.extra_args.iter().cloned());
        line.push(command.to_string());
        line
    }

    async fn submit(
        &self,
        line: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExternalHandle> {
        let (program, args) = line
            .split_first()
            .ok_or_else(|| BatchError::InvalidRequest("empty submission line".to_string()))?;
        let stdout = run_command(program, args, env).await?;
        tracing::debug!(output = %stdout.trim(), "bsub");
        parse_bsub_output(&stdout)
    }

    async fn query_exit_code(&self, handle: &ExternalHandle) -> Result<Option<i32>> {
        tracing::debug!(job = %handle.job, "Checking job exit code via bjobs");
        let output = combined_output("bjobs", &["-l", handle.job.as_str()]).await?;
        match parse_bjobs_detail(&output) {
            BjobsVerdict::Finished(code) => {
                if code != 0 {
                    tracing::error!(job = %handle.job, exit_code = code, "bjobs detected failed job");
                }
                return Ok(Some(code));
            }
            BjobsVerdict::Pending => return Ok(None),
            BjobsVerdict::Unknown => {}
        }

        tracing::debug!(job = %handle.job, "bjobs failed to detect job, trying bacct");
        let output = combined_output("bacct", &["-l", handle.job.as_str()]).await?;
        let code = parse_bacct_detail(&output);
        if code.is_none() {
            tracing::debug!(job = %handle.job, "Can't determine exit code, job may still be running");
        }
        Ok(code)
    }

    async fn list_running_handles(&self) -> Result<HashSet<ExternalHandle>> {
        let stdout = run_command("bjobs", &running_listing_args(), &HashMap::new()).await?;
        Ok(parse_running_listing(&stdout))
    }

    async fn kill(&self, job_id: JobId, handle: &ExternalHandle) -> Result<()> {
        tracing::debug!(job_id = %job_id, handle = %handle, "bkill");
        match run_command("bkill", &[handle.to_string()], &HashMap::new()).await {
            Ok(_) => Ok(()),
            Err(BatchError::CommandFailed { output, .. }) if bkill_found_job_gone(&output) => {
                tracing::debug!(job_id = %job_id, handle = %handle, output = %output.trim(), "Job already gone when killed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_running_times(&self) -> Result<HashMap<ExternalHandle, Duration>> {
        let stdout = run_command("bjobs", &running_listing_args(), &HashMap::new()).await?;
        Ok(parse_running_times(&stdout, Local::now().naive_local()))
    }

    async fn system_limits(&self) -> Result<Option<ResourceLimits>> {
        let stdout = run_command("lshosts", &[], &HashMap::new()).await?;
        let limits = parse_lshosts(&stdout, self.config.memory_unit);
        match &limits {
            Some(limits) => tracing::debug!(
                max_cores = limits.max_cores,
                max_memory = limits.max_memory,
                "Largest LSF host"
            ),
            None => tracing::warn!("lshosts returned no ncpus or maxmem information"),
        }
        Ok(limits)
    }

    /// LSF needs longer between queries than most schedulers.
    fn min_poll_wait(&self) -> Duration {
        Duration::from_secs(8)
    }
}

/// stdout and stderr of a status query, ignoring the exit status: bjobs and bacct
/// exit non-zero for jobs they do not know, which is an answer, not a failure.
async fn combined_output(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

fn running_listing_args() -> Vec<String> {
    vec![
        "-o".to_string(),
        "jobid stat start_time delimiter='|'".to_string(),
    ]
}

/// bkill fails for jobs that finished (or were cleaned up) between the last poll
/// and the kill.
pub fn bkill_found_job_gone(output: &str) -> bool {
    output.contains("already finished") || output.contains("No matching job")
}

/// `Job <1234> is submitted to default queue <normal>.` -> `1234`
pub fn parse_bsub_output(stdout: &str) -> Result<ExternalHandle> {
    let line = stdout.lines().next().unwrap_or_default();
    let id = line
        .split_whitespace()
        .nth(1)
        .map(|word| word.trim_matches(|c| c == '<' || c == '>'))
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| BatchError::Parse(format!("unexpected bsub output: {line:?}")))?;
    Ok(ExternalHandle::new(id))
}

pub fn parse_bjobs_detail(output: &str) -> BjobsVerdict {
    const EXITED: &str = "Exited with exit code ";

    let mut started = false;
    for line in output.lines() {
        if line.contains("Done successfully") {
            return BjobsVerdict::Finished(0);
        } else if line.contains("New job is waiting for scheduling")
            || line.contains("PENDING REASONS")
        {
            return BjobsVerdict::Pending;
        } else if let Some(pos) = line.find(EXITED) {
            let rest = &line[pos + EXITED.len()..];
            let code = rest
                .split('.')
                .next()
                .and_then(|c| c.trim().parse().ok())
                .unwrap_or(1);
            return BjobsVerdict::Finished(code);
        } else if line.contains("Completed <exit>") {
            return BjobsVerdict::Finished(1);
        } else if line.contains("Started on ") {
            started = true;
        }
    }

    if started {
        BjobsVerdict::Pending
    } else {
        BjobsVerdict::Unknown
    }
}

pub fn parse_bacct_detail(output: &str) -> Option<i32> {
    for line in output.lines() {
        if line.contains("Completed <done>") {
            return Some(0);
        } else if line.contains("Completed <exit>") {
            return Some(1);
        }
    }
    None
}

/// Rows of `bjobs -o "jobid stat start_time delimiter='|'"` whose state is `RUN`.
pub fn parse_running_listing(output: &str) -> HashSet<ExternalHandle> {
    running_rows(output).map(|(handle, _)| handle).collect()
}

/// Same rows as [`parse_running_listing`], with how long each has run as of `now`.
/// Unparseable start times count as zero.
pub fn parse_running_times(output: &str, now: NaiveDateTime) -> HashMap<ExternalHandle, Duration> {
    running_rows(output)
        .map(|(handle, start)| {
            let ran_for = start
                .and_then(|start| parse_start_time(start, now))
                .and_then(|start| (now - start).to_std().ok())
                .unwrap_or_default();
            (handle, ran_for)
        })
        .collect()
}

fn running_rows(output: &str) -> impl Iterator<Item = (ExternalHandle, Option<&str>)> {
    output.lines().filter_map(|line| {
        let mut items = line.trim().split('|');
        let id = items.next()?.trim();
        let stat = items.next()?.trim();
        (stat == "RUN" && !id.is_empty()).then(|| (ExternalHandle::new(id), items.next()))
    })
}

/// bjobs prints start times as `Oct 16 10:12`, sometimes with seconds and a
/// trailing flag letter, and never with a year.
pub fn parse_start_time(field: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let mut parts = field.split_whitespace();
    let (month, day, time) = (parts.next()?, parts.next()?, parts.next()?);
    let stamp = format!("{} {month} {day} {time}", now.year());
    let start = NaiveDateTime::parse_from_str(&stamp, "%Y %b %d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(&stamp, "%Y %b %d %H:%M"))
        .ok()?;
    if start > now + chrono::Duration::days(1) {
        // Started before new year.
        start.with_year(now.year() - 1)
    } else {
        Some(start)
    }
}

/// Largest `ncpus` and `maxmem` over the hosts `lshosts` lists. Memory without a
/// unit suffix is read in `default_unit`.
pub fn parse_lshosts(output: &str, default_unit: MemoryUnit) -> Option<ResourceLimits> {
    let mut lines = output.lines();
    let header: Vec<&str> = lines.next()?.split_whitespace().collect();
    let cpu_index = header.iter().position(|col| *col == "ncpus")?;
    let mem_index = header.iter().position(|col| *col == "maxmem")?;

    let mut max_cores = 0.0_f64;
    let mut max_memory = 0_u64;
    for line in lines {
        let items: Vec<&str> = line.split_whitespace().collect();
        if items.len() <= cpu_index.max(mem_index) {
            continue;
        }
        if let Ok(cores) = items[cpu_index].parse::<f64>() {
            max_cores = max_cores.max(cores);
        }
        if let Some(memory) = parse_lsf_memory(items[mem_index], default_unit) {
            max_memory = max_memory.max(memory);
        }
    }

    if max_cores == 0.0 || max_memory == 0 {
        return None;
    }
    Some(ResourceLimits {
        max_cores,
        max_memory,
        ..ResourceLimits::default()
    })
}

/// `15.5G` -> bytes. `-` and anything unparseable give `None`.
fn parse_lsf_memory(field: &str, default_unit: MemoryUnit) -> Option<u64> {
    let field = field.trim().trim_end_matches(['B', 'b']);
    let (digits, unit) = match field.chars().last()?.to_ascii_uppercase() {
        'K' => (&field[..field.len() - 1], 1u64 << 10),
        'M' => (&field[..field.len() - 1], 1 << 20),
        'G' => (&field[..field.len() - 1], 1 << 30),
        'T' => (&field[..field.len() - 1], 1 << 40),
        _ => (field, default_unit.bytes()),
    };
    let value: f64 = digits.parse().ok()?;
    (value >= 0.0).then(|| (value * unit as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bsub_line_with_memory_and_cores() {
        let driver = LsfDriver::default();
        let line = driver.format_submission(1.5, 3 << 30, JobId::from(42), "echo hi");
        assert_eq!(
            line,
            vec![
                "bsub",
                "-cwd",
                ".",
                "-o",
                "/dev/null",
                "-e",
                "/dev/null",
                "-J",
                "gridbridge_job_42",
                "-R",
                "select[type==X86_64] rusage[mem=3072]",
                "-M",
                "3072",
                "-n",
                "2",
                "echo hi",
            ]
        );
    }

    #[test]
    fn bsub_line_per_core_reservation_and_extra_args() {
        let driver = LsfDriver::new(LsfConfig {
            job_name_prefix: "wf_".to_string(),
            per_core_reservation: true,
            memory_unit: MemoryUnit::Gb,
            extra_args: vec!["-q".to_string(), "long".to_string()],
        });
        let line = driver.format_submission(4.0, 8 << 30, JobId::from(1), "run.sh");
        assert!(line.contains(&"wf_1".to_string()));
        assert!(line.contains(&"select[type==X86_64] rusage[mem=2]".to_string()));
        let tail: Vec<&str> = line[line.len() - 5..].iter().map(String::as_str).collect();
        assert_eq!(tail, vec!["-n", "4", "-q", "long", "run.sh"]);
    }

    #[test]
    fn bsub_line_without_memory() {
        let driver = LsfDriver::default();
        let line = driver.format_submission(1.0, 0, JobId::from(3), "true");
        assert!(!line.contains(&"-M".to_string()));
        assert!(!line.contains(&"-R".to_string()));
    }

    #[test]
    fn parses_bsub_job_id() {
        let handle =
            parse_bsub_output("Job <8812> is submitted to default queue <normal>.\n").unwrap();
        assert_eq!(handle, ExternalHandle::new("8812"));
        assert!(parse_bsub_output("").is_err());
        assert!(parse_bsub_output("Request aborted by esub.").is_err());
    }

    #[test]
    fn bjobs_verdicts() {
        let done = "Job <1>, User <me>\n Mon Jan 1: Started on <host1>\n Mon Jan 1: Done successfully. The CPU time used is 1.0 seconds.\n";
        assert_eq!(parse_bjobs_detail(done), BjobsVerdict::Finished(0));

        let exited = " Mon Jan 1: Started on <host1>\n Mon Jan 1: Exited with exit code 137. The CPU time used is 2.0 seconds.\n";
        assert_eq!(parse_bjobs_detail(exited), BjobsVerdict::Finished(137));

        let pending = " PENDING REASONS:\n Job slot limit reached;\n";
        assert_eq!(parse_bjobs_detail(pending), BjobsVerdict::Pending);

        let waiting = " New job is waiting for scheduling;\n";
        assert_eq!(parse_bjobs_detail(waiting), BjobsVerdict::Pending);

        let running = " Mon Jan 1: Started on <host1>, Execution Home </home/me>;\n";
        assert_eq!(parse_bjobs_detail(running), BjobsVerdict::Pending);

        assert_eq!(
            parse_bjobs_detail("Job <1> is not found\n"),
            BjobsVerdict::Unknown
        );
    }

    #[test]
    fn bacct_verdicts() {
        assert_eq!(parse_bacct_detail(" Mon Jan 1: Completed <done>.\n"), Some(0));
        assert_eq!(parse_bacct_detail(" Mon Jan 1: Completed <exit>.\n"), Some(1));
        assert_eq!(parse_bacct_detail("No matching job found\n"), None);
    }

    #[test]
    fn running_listing_keeps_only_run_rows() {
        let out = "JOBID|STAT|START_TIME\n101|RUN|Jan  1 10:00\n102|PEND|-\n103|RUN|Jan  1 10:05\n\n";
        let running = parse_running_listing(out);
        assert_eq!(running.len(), 2);
        assert!(running.contains(&ExternalHandle::new("101")));
        assert!(running.contains(&ExternalHandle::new("103")));
    }

    #[test]
    fn running_times_from_start_column() {
        let now = NaiveDateTime::parse_from_str("2026-10-16 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let out = "JOBID|STAT|START_TIME\n101|RUN|Oct 16 10:00\n102|PEND|-\n103|RUN|Oct 16 11:59:30 L\n104|RUN|-\n";
        let times = parse_running_times(out, now);
        assert_eq!(times.len(), 3);
        assert_eq!(times[&ExternalHandle::new("101")], Duration::from_secs(2 * 3600));
        assert_eq!(times[&ExternalHandle::new("103")], Duration::from_secs(30));
        assert_eq!(times[&ExternalHandle::new("104")], Duration::ZERO);
    }

    #[test]
    fn start_time_without_year_wraps_to_last_year() {
        let now = NaiveDateTime::parse_from_str("2027-01-01 00:10:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let start = parse_start_time("Dec 31 23:10", now).unwrap();
        assert_eq!((now - start).num_minutes(), 60);
        assert!(parse_start_time("-", now).is_none());
    }

    #[test]
    fn lshosts_largest_host() {
        let out = "HOST_NAME      type    model  cpuf ncpus maxmem maxswp server RESOURCES\n\
                   hostA        X86_64  Intel_EM64T 60.0 16 62.7G 31.9G Yes (mg)\n\
                   hostB        X86_64  Intel_EM64T 60.0 64 250G  4G    Yes (mg)\n\
                   hostC        UNKNOWN UNKNOWN 1.0  -     -      -     Yes (mg)\n";
        let limits = parse_lshosts(out, MemoryUnit::Mb).unwrap();
        assert_eq!(limits.max_cores, 64.0);
        assert_eq!(limits.max_memory, 250u64 << 30);
        assert_eq!(limits.max_disk, ResourceLimits::default().max_disk);
    }

    #[test]
    fn lshosts_plain_memory_uses_configured_unit() {
        let out = "HOST_NAME type ncpus maxmem\nh1 X86_64 8 2048\n";
        let limits = parse_lshosts(out, MemoryUnit::Mb).unwrap();
        assert_eq!(limits.max_memory, 2048u64 << 20);
    }

    #[test]
    fn lshosts_without_columns_gives_nothing() {
        assert!(parse_lshosts("HOST_NAME type model\nh1 X86_64 m\n", MemoryUnit::Mb).is_none());
        assert!(parse_lshosts("HOST_NAME ncpus maxmem\nh1 - -\n", MemoryUnit::Mb).is_none());
        assert!(parse_lshosts("", MemoryUnit::Mb).is_none());
    }

    #[test]
    fn bkill_on_finished_job_is_not_a_failure() {
        assert!(bkill_found_job_gone("Job <77>: Job has already finished\n"));
        assert!(bkill_found_job_gone("Job <78>: No matching job found\n"));
        assert!(!bkill_found_job_gone("Job <79>: User permission denied\n"));
        assert!(!bkill_found_job_gone("bkill: LSF is down. Please wait ...\n"));
    }

    #[test]
    fn lsf_waits_longer_between_polls() {
        assert_eq!(LsfDriver::default().min_poll_wait(), Duration::from_secs(8));
    }
}

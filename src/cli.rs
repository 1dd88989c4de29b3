//! Command-line parsing.

use std::path::PathBuf;

pub const USAGE: &str = "\
usage: therm [--env-file PATH] <command>

commands:
  poll [--force] [--no-reset] [--simulate] [--memory]
                         run the thermostat until interrupted
  set TEMP               enable the set point at TEMP
  unset                  disable the set point
  state                  print the current state
  chart [--hours N] [--points M]
                         print aligned samples and states as JSON
  init-db                apply database migrations
  populate-db            insert demo data
  truncate-db            delete all samples and states
  drop-db                drop the sample and state tables";

pub const DEFAULT_CHART_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOptions {
    /// Clear a lock left behind by another poller.
    pub force: bool,
    /// Keep the recorded state instead of disabling the set point on start.
    pub no_reset: bool,
    pub simulate: bool,
    /// Keep the event log in memory instead of PostgreSQL.
    pub memory: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Poll(PollOptions),
    Set(f64),
    Unset,
    State,
    Chart { hours: i64, points: Option<usize> },
    InitDb,
    PopulateDb,
    TruncateDb,
    DropDb,
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub env_file: Option<PathBuf>,
    pub command: CliCommand,
}

fn flag_value(flag: &str, value: Option<String>) -> Result<String, String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("`{}` requires a value", flag))
}

/// Split `--flag=value` into its parts.
fn split_inline(arg: &str) -> (&str, Option<String>) {
    match arg.split_once('=') {
        Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
        _ => (arg, None),
    }
}

fn parse_poll(rest: impl Iterator<Item = String>) -> Result<CliCommand, String> {
    let mut options = PollOptions::default();
    for arg in rest {
        match arg.as_str() {
            "--force" => options.force = true,
            "--no-reset" => options.no_reset = true,
            "--simulate" => options.simulate = true,
            "--memory" => options.memory = true,
            other => return Err(format!("poll: unrecognised argument: {}", other)),
        }
    }
    Ok(CliCommand::Poll(options))
}

fn parse_chart(mut rest: impl Iterator<Item = String>) -> Result<CliCommand, String> {
    let mut hours = DEFAULT_CHART_HOURS;
    let mut points = None;
    while let Some(arg) = rest.next() {
        let (flag, inline) = split_inline(&arg);
        match flag {
            "--hours" => {
                let raw = flag_value(flag, inline.or_else(|| rest.next()))?;
                hours = raw
                    .parse()
                    .ok()
                    .filter(|h: &i64| *h > 0)
                    .ok_or_else(|| format!("--hours must be a positive integer, got {}", raw))?;
            }
            "--points" => {
                let raw = flag_value(flag, inline.or_else(|| rest.next()))?;
                points = Some(
                    raw.parse()
                        .ok()
                        .filter(|p: &usize| *p > 0)
                        .ok_or_else(|| format!("--points must be a positive integer, got {}", raw))?,
                );
            }
            other => return Err(format!("chart: unrecognised argument: {}", other)),
        }
    }
    Ok(CliCommand::Chart { hours, points })
}

fn no_arguments(name: &str, command: CliCommand, mut rest: impl Iterator<Item = String>) -> Result<CliCommand, String> {
    match rest.next() {
        Some(extra) => Err(format!("{}: unexpected argument: {}", name, extra)),
        None => Ok(command),
    }
}

/// Parse arguments, excluding the program name.
pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Cli, String> {
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let (flag, inline) = split_inline(&arg);
        let command = match flag {
            "--env-file" => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = flag_value(flag, inline.or_else(|| args.next()))?;
                env_file = Some(PathBuf::from(value));
                continue;
            }
            "-h" | "--help" | "help" => CliCommand::Help,
            "poll" => parse_poll(args)?,
            "set" => {
                let raw = args.next().ok_or_else(|| "set: missing TEMP argument".to_string())?;
                let temp: f64 = raw
                    .parse()
                    .ok()
                    .filter(|t: &f64| t.is_finite())
                    .ok_or_else(|| format!("set: TEMP must be a number, got {}", raw))?;
                no_arguments("set", CliCommand::Set(temp), args)?
            }
            "unset" => no_arguments("unset", CliCommand::Unset, args)?,
            "state" => no_arguments("state", CliCommand::State, args)?,
            "chart" => parse_chart(args)?,
            "init-db" => no_arguments("init-db", CliCommand::InitDb, args)?,
            "populate-db" => no_arguments("populate-db", CliCommand::PopulateDb, args)?,
            "truncate-db" => no_arguments("truncate-db", CliCommand::TruncateDb, args)?,
            "drop-db" => no_arguments("drop-db", CliCommand::DropDb, args)?,
            other => return Err(format!("unrecognised argument: {}", other)),
        };
        return Ok(Cli { env_file, command });
    }
    Err(format!("missing command\n\n{}", USAGE))
}

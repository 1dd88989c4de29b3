pub mod cli;
pub mod config;
pub mod db {
    pub mod event_log;
    pub mod memory;
    pub mod models;
    pub mod pg;
}
pub mod hardware;
pub mod schema;
pub mod services {
    pub mod aligner;
    pub mod control;
    pub mod dispatch;
    pub mod fake_data;
    pub mod lock;
    #[cfg(test)]
    pub mod testing;
}

use crate::cli::{Cli, CliCommand, PollOptions, USAGE};
use crate::config::{Config, HardwareConfig, load_env_file};
use crate::db::event_log::{EventLog, SINCE_LIMIT};
use crate::db::memory::MemoryEventLog;
use crate::db::models::{NewState, State, StateUpdate};
use crate::db::pg::PgEventLog;
use crate::hardware::buttons::GpioButtons;
use crate::hardware::linux::{input_pin, open_i2c, output_pin};
use crate::hardware::mpl115::Mpl115;
use crate::hardware::relay::GpioRelay;
use crate::hardware::simulated::{SimulatedRelay, SimulatedSensor, StdinButtons};
use crate::hardware::{ButtonPort, RelayPort, SensorPort};
use crate::services::aligner::{self, Fill};
use crate::services::control::ControlLoop;
use crate::services::dispatch::{ButtonDispatcher, Command};
use crate::services::fake_data;
use crate::services::lock::PollLock;
use chrono::{Duration, Utc};
use log::{error, info};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::path::PathBuf;
use std::sync::mpsc;

const SIMULATED_START_TEMP_F: f64 = 68.0;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
    variables: usize,
}

struct Hardware {
    sensor: Box<dyn SensorPort>,
    relay: Box<dyn RelayPort>,
    buttons: Box<dyn ButtonPort>,
}

fn open_hardware(hw: &HardwareConfig) -> Result<Hardware, String> {
    let bus = open_i2c(hw.sensor_bus_id).map_err(|e| e.to_string())?;
    let heat = output_pin(hw.heat_gpio).map_err(|e| e.to_string())?;
    let input = |pin: u32| input_pin(pin).map_err(|e| e.to_string());
    let buttons = GpioButtons::new(input(hw.pin_on_off)?, input(hw.pin_up)?, input(hw.pin_down)?, hw.button_bounce);
    info!(
        "Hardware: MPL115 on /dev/i2c-{} at {:#04x}, heat relay on GPIO {}, buttons on GPIO {}/{}/{}",
        hw.sensor_bus_id, hw.sensor_address, hw.heat_gpio, hw.pin_on_off, hw.pin_up, hw.pin_down
    );
    Ok(Hardware {
        sensor: Box::new(Mpl115::new(bus, hw.sensor_address, hw.temp_calibration_f)),
        relay: Box::new(GpioRelay::new(heat)),
        buttons: Box::new(buttons),
    })
}

fn simulated_hardware() -> Hardware {
    let relay = SimulatedRelay::new();
    info!("Hardware: simulated (start temp {} F)", SIMULATED_START_TEMP_F);
    Hardware {
        sensor: Box::new(SimulatedSensor::new(SIMULATED_START_TEMP_F, &relay)),
        relay: Box::new(relay),
        buttons: Box::new(StdinButtons::new()),
    }
}

fn open_db(cfg: &Config) -> Result<PgEventLog, String> {
    let mut log = PgEventLog::connect(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");
    log.apply_migrations().map_err(|e| e.to_string())?;
    Ok(log)
}

fn poll(cfg: &Config, options: PollOptions) -> Result<(), String> {
    // Handler first, so an interrupt during startup still unwinds the lock guard.
    let (tx, rx) = mpsc::channel();
    let interrupt = tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt.send(Command::Shutdown);
    })
    .map_err(|e| format!("installing Ctrl-C handler failed: {}", e))?;

    let _lock = PollLock::acquire(&cfg.lockfile, options.force).map_err(|e| e.to_string())?;

    let hardware = if options.simulate {
        simulated_hardware()
    } else {
        open_hardware(&cfg.hardware)?
    };

    let dispatcher = ButtonDispatcher::new(cfg.control.temp_increment);
    let _buttons = dispatcher
        .register(hardware.buttons, &tx)
        .map_err(|e| format!("registering buttons failed: {}", e))?;
    drop(tx);

    if options.memory {
        info!("Event log: in memory; nothing will be persisted");
        drive(MemoryEventLog::new(), hardware.sensor, hardware.relay, cfg, options, &dispatcher, &rx)
    } else {
        drive(open_db(cfg)?, hardware.sensor, hardware.relay, cfg, options, &dispatcher, &rx)
    }
}

fn drive<L: EventLog>(
    log: L,
    sensor: Box<dyn SensorPort>,
    relay: Box<dyn RelayPort>,
    cfg: &Config,
    options: PollOptions,
    dispatcher: &ButtonDispatcher,
    commands: &mpsc::Receiver<Command>,
) -> Result<(), String> {
    let mut control = ControlLoop::new(log, sensor, relay, cfg.control.clone());
    if !options.no_reset {
        control.reset().map_err(|e| format!("reset failed: {}", e))?;
    }
    info!(
        "Starting poll loop: interval={}s, window={}, increment={}",
        cfg.control.poll_interval.as_secs(),
        cfg.control.temp_window,
        cfg.control.temp_increment
    );
    control.run(dispatcher, commands).map_err(|e| e.to_string())?;
    info!("Poll loop stopped; goodbye!");
    Ok(())
}

fn set(log: &mut impl EventLog, cfg: &Config, temp: f64) -> Result<State, String> {
    if log.latest_state().map_err(|e| e.to_string())?.is_none() {
        info!("No state recorded yet; seeding set point {}", temp);
        let seed = NewState {
            location: cfg.control.location.clone(),
            ..NewState::initial(temp, true)
        };
        return log.insert_state(seed).map_err(|e| e.to_string());
    }
    log.update_state(StateUpdate::SetPoint(temp)).map_err(|e| e.to_string())?;
    log.update_state(StateUpdate::SetPointEnabled(true))
        .map_err(|e| e.to_string())?;
    log.require_latest_state().map_err(|e| e.to_string())
}

fn unset(log: &mut impl EventLog) -> Result<State, String> {
    log.update_state(StateUpdate::SetPointEnabled(false))
        .map_err(|e| format!("unset failed: {}", e))?;
    log.require_latest_state().map_err(|e| e.to_string())
}

fn chart(log: &mut impl EventLog, hours: i64, max_points: usize) -> Result<String, String> {
    let since = Utc::now() - Duration::hours(hours);
    let samples = log
        .samples_since(since, None, SINCE_LIMIT)
        .map_err(|e| format!("loading samples failed: {}", e))?;
    let mut states: Vec<_> = log
        .states_since(since, None, SINCE_LIMIT)
        .map_err(|e| format!("loading states failed: {}", e))?
        .into_iter()
        .map(|s| (s.time, s))
        .collect();
    // The state in force when the window opens anchors the forward fill.
    if states.first().is_none_or(|(time, _)| *time > since) {
        if let Some(prior) = log.state_at(since).map_err(|e| format!("loading states failed: {}", e))? {
            states.insert(0, (since, prior));
        }
    }
    info!(
        "Charting {} samples and {} states from the last {}h (max {} points)",
        samples.len(),
        states.len(),
        hours,
        max_points
    );

    let temps: Vec<_> = samples.into_iter().map(|s| (s.time, s.temp)).collect();
    let aligned = aligner::align(&temps, Fill::Gaps, &states, Fill::Forward, max_points);
    serde_json::to_string_pretty(&aligned).map_err(|e| format!("serializing chart failed: {}", e))
}

pub fn run(cli: Cli) -> Result<(), String> {
    if cli.command == CliCommand::Help {
        println!("{}", USAGE);
        return Ok(());
    }
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (poll_interval={}s, temp_window={}, temp_increment={}, max_sensor_failures={}, location={})",
        cfg.control.poll_interval.as_secs(),
        cfg.control.temp_window,
        cfg.control.temp_increment,
        cfg.control.max_sensor_failures.get(),
        cfg.control.location.as_deref().unwrap_or("-")
    );

    match cli.command {
        CliCommand::Help => {}
        CliCommand::Poll(options) => poll(&cfg, options)?,
        CliCommand::Set(temp) => println!("{}", set(&mut open_db(&cfg)?, &cfg, temp)?),
        CliCommand::Unset => println!("{}", unset(&mut open_db(&cfg)?)?),
        CliCommand::State => {
            let mut log = open_db(&cfg)?;
            match log.latest_state().map_err(|e| e.to_string())? {
                Some(state) => println!("{}", state),
                None => println!("No state recorded"),
            }
            let location = cfg.control.location.as_deref();
            if let Some(sample) = log.latest_sample(location).map_err(|e| e.to_string())? {
                println!(
                    "Last reading {:.2} F at {}",
                    sample.temp,
                    sample.time.format("%Y-%m-%d %H:%M")
                );
            }
        }
        CliCommand::Chart { hours, points } => {
            let max_points = points.unwrap_or(cfg.chart_max_points);
            println!("{}", chart(&mut open_db(&cfg)?, hours, max_points)?);
        }
        CliCommand::InitDb => {
            open_db(&cfg)?;
            println!("Initialized {}.", cfg.database_url);
        }
        CliCommand::PopulateDb => {
            let mut log = open_db(&cfg)?;
            let mut rng = SmallRng::from_os_rng();
            let written = fake_data::populate(&mut log, &mut rng, cfg.control.location.as_deref())
                .map_err(|e| format!("populating database failed: {}", e))?;
            println!(
                "Added {} Samples and {} State to db {}",
                written.samples, written.states, cfg.database_url
            );
        }
        CliCommand::TruncateDb => {
            let (samples, states) = open_db(&cfg)?.truncate().map_err(|e| e.to_string())?;
            println!("Truncated sample ({} rows), state ({} rows)", samples, states);
        }
        CliCommand::DropDb => {
            let mut log =
                PgEventLog::connect(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
            let reverted = log.drop_schema().map_err(|e| e.to_string())?;
            println!("Dropped sample and state from {} ({} migrations reverted)", cfg.database_url, reverted);
        }
    }
    Ok(())
}

fn load_environment(cli: &Cli) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = cli.env_file.clone() {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        let variables = load_env_file(&path)?;
        return Ok(Some(LoadedEnvFile {
            path,
            explicit: true,
            variables,
        }));
    }
    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if !default_path.is_file() {
        return Ok(None);
    }
    let variables = load_env_file(&default_path)?;
    Ok(Some(LoadedEnvFile {
        path: default_path,
        explicit: false,
        variables,
    }))
}

fn collect_args() -> Result<Vec<String>, String> {
    std::env::args_os()
        .skip(1)
        .map(|arg| {
            arg.into_string()
                .map_err(|_| "argument contains invalid UTF-8".to_string())
        })
        .collect()
}

fn main() {
    let prepared = collect_args()
        .and_then(cli::parse)
        .and_then(|cli| load_environment(&cli).map(|env| (cli, env)));
    let (cli, loaded_env) = match prepared {
        Ok(parts) => parts,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!(
            "Environment loaded from {} .env file: {} ({} new variables)",
            origin,
            info.path.display(),
            info.variables
        );
    }

    info!("therm {} (git {}) starting", env!("CARGO_PKG_VERSION"), env!("BUILD_TIME_GIT_HASH"));
    if let Err(e) = run(cli) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::seed_state;

    fn config() -> Config {
        Config {
            database_url: "postgres://localhost/therm_test".to_string(),
            lockfile: "/tmp/therm-test-polling".to_string(),
            chart_max_points: 50,
            control: Default::default(),
            hardware: HardwareConfig {
                heat_gpio: 18,
                pin_on_off: 17,
                pin_up: 23,
                pin_down: 22,
                button_bounce: std::time::Duration::from_millis(300),
                sensor_bus_id: 1,
                sensor_address: 0x60,
                temp_calibration_f: 0.0,
            },
        }
    }

    #[test]
    fn set_seeds_first_state_then_updates() {
        let mut log = MemoryEventLog::new();
        let seeded = set(&mut log, &config(), 70.0).unwrap();
        assert_eq!(seeded.set_point, 70.0);
        assert!(seeded.set_point_enabled);

        let updated = set(&mut log, &config(), 68.0).unwrap();
        assert_eq!(updated.set_point, 68.0);
        assert_eq!(log.state_count(), 2);
    }

    #[test]
    fn set_reenables_disabled_set_point() {
        let mut log = seed_state(72.0, false, false);
        let state = set(&mut log, &config(), 72.0).unwrap();
        assert!(state.set_point_enabled);
        assert_eq!(log.state_count(), 2);
    }

    #[test]
    fn unset_requires_state() {
        assert!(unset(&mut MemoryEventLog::new()).is_err());
        let mut log = seed_state(72.0, true, false);
        assert!(!unset(&mut log).unwrap().set_point_enabled);
    }

    #[test]
    fn chart_emits_aligned_json() {
        let mut log = seed_state(72.0, true, false);
        let now = Utc::now();
        for minutes in [50, 30, 10] {
            log.append_sample(crate::db::models::NewSample {
                time: now - Duration::minutes(minutes),
                temp: 70.0,
                pressure: None,
                location: None,
            })
            .unwrap();
        }
        let json: serde_json::Value = serde_json::from_str(&chart(&mut log, 24, 50).unwrap()).unwrap();
        assert!(json["bucket_secs"].as_i64().unwrap() >= aligner::MIN_BUCKET_SECS);
        let left = json["left"].as_array().unwrap();
        let right = json["right"].as_array().unwrap();
        assert_eq!(left.len(), right.len());
        assert!(left.len() <= 52);
        assert_eq!(right.last().unwrap()["value"]["set_point"], 72.0);
    }

    #[test]
    fn help_runs_without_config() {
        let cli = Cli {
            env_file: None,
            command: CliCommand::Help,
        };
        assert_eq!(run(cli), Ok(()));
    }

    #[test]
    fn chart_carries_state_from_before_the_window() {
        let mut log = MemoryEventLog::new();
        let now = Utc::now();
        log.insert_state(NewState {
            time: now - Duration::hours(30),
            ..NewState::initial(68.0, true)
        })
        .unwrap();
        for minutes in [600, 300, 60] {
            log.append_sample(crate::db::models::NewSample {
                time: now - Duration::minutes(minutes),
                temp: 66.0,
                pressure: None,
                location: None,
            })
            .unwrap();
        }
        let json: serde_json::Value = serde_json::from_str(&chart(&mut log, 24, 50).unwrap()).unwrap();
        let right = json["right"].as_array().unwrap();
        assert_eq!(right[0]["value"]["set_point"], 68.0);
        assert!(right.iter().all(|point| !point["value"].is_null()));
        assert_eq!(json["left"][0]["value"], serde_json::Value::Null);
    }
}

pub mod models {
    pub mod dkn;
}

pub mod bridge {
    pub mod cloud;
    pub mod device;
    pub mod installation;
}
pub mod client;
pub mod config;
pub mod entities {
    pub mod climate;
    pub mod workday;
}
pub mod envfile;
pub mod holidays;
pub mod socketio;
#[cfg(test)]
mod testing;
pub mod utils;

use crate::bridge::cloud::CloudSession;
use crate::client::DknClient;
use crate::config::{CloudConfig, Config, WorkdayConfig};
use crate::entities::climate::ClimateEntity;
use crate::entities::workday::WorkdaySensor;
use crate::holidays::BuiltinHolidays;
use chrono::Local;
use log::{error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CHANNEL_CHECK_INTERVAL: Duration = Duration::from_secs(30);

struct Climate {
    session: CloudSession,
    entities: Vec<ClimateEntity>,
}

fn start_climate(cfg: &CloudConfig) -> Result<Climate, String> {
    let mut session = CloudSession::new(DknClient::new(&cfg.api_url, &cfg.scope));
    session
        .login(&cfg.username, &cfg.password)
        .map_err(|e| format!("DKN Cloud login failed: {}", e))?;

    let mut entities = Vec::new();
    for installation in session.installations().values() {
        for device in installation.devices() {
            let entity = ClimateEntity::new(Arc::clone(device));
            let label = format!("{}/{}", installation.name(), entity.name());
            entity.added_to_host(move |state| match serde_json::to_string(state) {
                Ok(json) => info!("Climate '{}': {}", label, json),
                Err(e) => warn!("Climate '{}': state not serializable: {}", label, e),
            });
            entities.push(entity);
        }
    }
    info!("Attached {} climate entity(ies)", entities.len());
    Ok(Climate { session, entities })
}

type Login = JoinHandle<Result<Climate, String>>;

/// Log in on a background thread; the first installation wait can block for a long time.
fn spawn_login(cfg: &CloudConfig) -> Result<Login, String> {
    let cfg = cfg.clone();
    thread::Builder::new()
        .name("dkn-login".to_string())
        .spawn(move || start_climate(&cfg))
        .map_err(|e| format!("Failed to start DKN Cloud login: {}", e))
}

fn finish_login(login: Login) -> Result<Climate, String> {
    login
        .join()
        .map_err(|_| "DKN Cloud login thread panicked".to_string())?
}

/// Take the login result once it is available, without blocking.
fn poll_login(login: &mut Option<Login>) -> Option<Result<Climate, String>> {
    if !login.as_ref().is_some_and(JoinHandle::is_finished) {
        return None;
    }
    login.take().map(finish_login)
}

fn start_workday(cfg: &WorkdayConfig) -> Option<WorkdaySensor> {
    let today = Local::now().date_naive();
    match WorkdaySensor::new(cfg.options.clone(), Arc::new(BuiltinHolidays), today) {
        Ok(sensor) => {
            info!(
                "Workday sensor '{}' ready ({} holiday(s) in {})",
                sensor.name(),
                sensor.calendar().len(),
                sensor.calendar().year()
            );
            Some(sensor)
        }
        Err(e) => {
            error!("Workday sensor '{}' not created: {}", cfg.options.name, e);
            None
        }
    }
}

fn evaluate_workday(sensor: &mut WorkdaySensor) {
    let previous = sensor.is_on();
    let on = sensor.update(Local::now().date_naive());
    if previous != Some(on) {
        let attrs = serde_json::to_string(&sensor.extra_state_attributes()).unwrap_or_default();
        info!(
            "Workday sensor '{}' is now {} {}",
            sensor.name(),
            if on { "on" } else { "off" },
            attrs
        );
    }
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (climate={}, workday={})",
        cfg.climate
            .as_ref()
            .map(|c| format!("{} @ {}", c.username, c.api_url))
            .unwrap_or_else(|| "-".to_string()),
        cfg.workday
            .as_ref()
            .map(|w| format!("{} every {}s", w.options.country, w.refresh_interval.as_secs()))
            .unwrap_or_else(|| "-".to_string()),
    );

    // 2) Workday sensor
    let mut workday = cfg.workday.as_ref().and_then(start_workday);

    // 3) Cloud login and climate entities, in the background while the sensor runs
    let mut login = cfg.climate.as_ref().map(spawn_login).transpose()?;
    let mut climate = None;
    if workday.is_none() {
        match login.take() {
            Some(handle) => climate = Some(finish_login(handle)?),
            None => return Err("No component could be started".to_string()),
        }
    }

    // 4) Host loop
    let tick = cfg
        .workday
        .as_ref()
        .filter(|_| workday.is_some())
        .map(|w| w.refresh_interval)
        .unwrap_or(CHANNEL_CHECK_INTERVAL);
    loop {
        if let Some(sensor) = workday.as_mut() {
            evaluate_workday(sensor);
        }
        match poll_login(&mut login) {
            Some(Ok(c)) => climate = Some(c),
            Some(Err(e)) => error!("Climate entities not created: {}", e),
            None => {}
        }
        if let Some(c) = climate.as_mut()
            && !c.session.installations().values().any(|i| i.is_connected())
        {
            error!("All DKN Cloud channels are closed; climate entities are no longer updated");
            for entity in &c.entities {
                entity.will_remove_from_host();
            }
            c.session.close();
            climate = None;
            if workday.is_none() {
                return Err("DKN Cloud connection lost".to_string());
            }
        }
        thread::sleep(tick);
    }
}

fn main() {
    let loaded_env = match envfile::load_from_args(std::env::args_os().skip(1)) {
        Ok(info) => info,
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
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "dkn-bridge {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;
    use std::time::Instant;

    fn cloud_config(url: &str) -> CloudConfig {
        CloudConfig {
            username: "user@example.com".to_string(),
            password: "secret".to_string(),
            api_url: url.to_string(),
            scope: "dknUsa".to_string(),
        }
    }

    #[test]
    fn pending_login_does_not_block_the_host() {
        let cloud = FakeCloud::start(&["A1B2C3D4E5F6"]);
        let mut login = Some(spawn_login(&cloud_config(&cloud.url)).unwrap());

        thread::sleep(Duration::from_millis(300));
        let started = Instant::now();
        assert!(poll_login(&mut login).is_none());
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(login.is_some());

        cloud.hang_up();
        let deadline = Instant::now() + Duration::from_secs(10);
        let climate = loop {
            if let Some(result) = poll_login(&mut login) {
                break result.expect("login finished");
            }
            assert!(Instant::now() < deadline, "login never finished");
            thread::sleep(Duration::from_millis(20));
        };
        // only the installation that reported data gets entities
        assert_eq!(climate.entities.len(), 2);
        assert!(login.is_none());
    }

    #[test]
    fn failed_login_is_reported_once() {
        let mut login = Some(spawn_login(&cloud_config("http://127.0.0.1:9/")).unwrap());
        let err = finish_login(login.take().unwrap()).err().expect("login fails");
        assert!(err.starts_with("DKN Cloud login failed"), "{err}");
        assert!(poll_login(&mut login).is_none());
    }
}

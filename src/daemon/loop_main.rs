//! Service loop: periodic upload checks plus signal-driven reload, immediate
//! check, and shutdown.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{Receiver, select, tick};

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::service::BeaconService;
use crate::daemon::signals::SignalHandler;
use crate::logger::dual::ActivityEvent;
use crate::upload::scheduler::{DeviceConditions, ScheduleDecision};

/// How often the loop wakes to look at signal flags between ticks.
const SIGNAL_POLL: Duration = Duration::from_millis(250);

/// Arguments for `beacon daemon`.
#[derive(Debug, Clone, Default)]
pub struct DaemonArgs {
    /// Config file re-read on SIGHUP; `None` uses the default location.
    pub config_path: Option<PathBuf>,
    /// Device conditions assumed for every check.
    pub conditions: DeviceConditions,
}

pub struct ServiceLoop<'a> {
    service: &'a BeaconService,
    signals: SignalHandler,
    args: DaemonArgs,
    ticker: Receiver<std::time::Instant>,
    interval: Duration,
}

impl<'a> ServiceLoop<'a> {
    #[must_use]
    pub fn new(service: &'a BeaconService, signals: SignalHandler, args: DaemonArgs) -> Self {
        let interval = service.check_interval();
        Self {
            service,
            signals,
            args,
            ticker: tick(interval),
            interval,
        }
    }

    /// Run until shutdown is requested. The first check runs immediately so a
    /// batch left pending by an earlier process is resumed at startup.
    pub fn run(&mut self) -> Result<()> {
        eprintln!(
            "[UMB-DAEMON] started (check every {}s)",
            self.interval.as_secs()
        );
        self.check();

        loop {
            if self.signals.should_shutdown() {
                eprintln!("[UMB-DAEMON] shutdown requested");
                break;
            }
            if self.signals.should_reload() {
                self.reload();
            }
            if self.signals.should_check() {
                self.check();
            }

            select! {
                recv(self.ticker) -> _ => {
                    self.service.flush_recordings();
                    self.check();
                }
                default(SIGNAL_POLL) => {}
            }
        }
        Ok(())
    }

    fn check(&self) {
        match self.service.check_now(self.args.conditions) {
            Ok(ScheduleDecision::Skipped { .. }) => {}
            Ok(decision) => {
                if let Some(batch_id) = decision.batch_id() {
                    eprintln!("[UMB-DAEMON] handed batch {batch_id} to delivery");
                }
            }
            Err(err) => {
                eprintln!("[UMB-DAEMON] upload check failed: {err}");
                self.service.logger().send(ActivityEvent::from_error(&err));
            }
        }
    }

    fn reload(&mut self) {
        eprintln!("[UMB-DAEMON] config reload requested");
        let loaded = Config::load(self.args.config_path.as_deref())
            .and_then(|config| self.service.apply_config(config));
        match loaded {
            Ok(true) => {
                let interval = self.service.check_interval();
                if interval != self.interval {
                    self.interval = interval;
                    self.ticker = tick(interval);
                }
                eprintln!("[UMB-DAEMON] config reloaded");
            }
            Ok(false) => eprintln!("[UMB-DAEMON] config unchanged, skipping reload"),
            Err(err) => {
                eprintln!("[UMB-DAEMON] config reload failed: {err}");
                self.service.logger().send(ActivityEvent::from_error(&err));
            }
        }
    }
}

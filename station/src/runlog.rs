//! Append-only crash log
//!
//! One log file per run, opened lazily the first time something goes wrong.
//! The entry header format is what the rig's post-mortem tooling greps for.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use phstat_core::clock::Clock;

pub struct RunLog {
    clock: Arc<dyn Clock>,
    path: Option<PathBuf>,
    file: Option<File>,
}

impl RunLog {
    /// A log that swallows everything; tests and the broker-less utility
    /// paths use this.
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            path: None,
            file: None,
        }
    }

    /// A log named after the protocol and the moment logging was set up.
    pub fn for_protocol(protocol_path: &Path, clock: Arc<dyn Clock>) -> Self {
        let timestamp = humantime::format_rfc3339_seconds(clock.now())
            .to_string()
            .replace(':', "_");
        let mut name = protocol_path.as_os_str().to_os_string();
        name.push(format!("_{timestamp}.log"));
        Self {
            clock,
            path: Some(PathBuf::from(name)),
            file: None,
        }
    }

    /// Points the log at a different protocol; the next entry opens the new
    /// file.
    pub fn set_protocol(&mut self, protocol_path: &Path) {
        let fresh = Self::for_protocol(protocol_path, self.clock.clone());
        self.path = fresh.path;
        self.file = None;
    }

    pub fn log(&mut self, error: &dyn Display) {
        let Some(path) = self.path.clone() else {
            return;
        };
        if self.file.is_none() {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => self.file = Some(file),
                Err(e) => {
                    error!("could not open run log {path:?}: {e}");
                    return;
                }
            }
        }
        let file = self.file.as_mut().unwrap();
        let now = humantime::format_rfc3339_seconds(self.clock.now());
        if let Err(e) = writeln!(file, "-------- LOG AT {now} --------\n{error}") {
            error!("could not append to run log {path:?}: {e}");
        }
    }
}

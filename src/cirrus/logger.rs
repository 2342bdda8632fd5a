/*
 * Copyright (C) 2025 The Cirrus Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use chrono::{SecondsFormat, Utc};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

const SERVICE_NAME: &str = "cirrus";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

struct CirrusLogger;

impl Log for CirrusLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record.level(), record.target(), &record.args().to_string());
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
    }

    fn flush(&self) {
        let _ = io::stdout().lock().flush();
    }
}

fn format_line(level: Level, target: &str, message: &str) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    match current_log_format() {
        LogFormat::Text => format!("{} {:<5} {} {}", timestamp, level, target, message),
        LogFormat::Json => serde_json::json!({
            "ts": timestamp,
            "level": level.to_string().to_lowercase(),
            "service": SERVICE_NAME,
            "target": target,
            "msg": message,
        })
        .to_string(),
    }
}

/// Installs the process logger. Safe to call more than once; only the first
/// call wins.
pub fn init(level: &str, format: LogFormat) {
    set_log_format(format);
    let filter = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    if log::set_boxed_logger(Box::new(CirrusLogger)).is_ok() {
        log::set_max_level(filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_lines_carry_level_and_target() {
        set_log_format(LogFormat::Text);
        let line = format_line(Level::Warn, "cirrus::disruption", "budget exhausted");
        assert!(line.contains("WARN"));
        assert!(line.contains("cirrus::disruption"));
        assert!(line.contains("budget exhausted"));
    }

    #[test]
    fn json_lines_are_parseable() {
        set_log_format(LogFormat::Json);
        let line = format_line(Level::Info, "cirrus::provisioner", "created 2 claims");
        let value: serde_json::Value = serde_json::from_str(&line).expect("json line");
        assert_eq!(value["level"], "info");
        assert_eq!(value["service"], "cirrus");
        assert_eq!(value["msg"], "created 2 claims");
        set_log_format(LogFormat::Text);
    }

    #[test]
    fn unknown_format_strings_are_rejected() {
        assert!(LogFormat::from_str("yaml").is_err());
        assert_eq!(LogFormat::from_str("json").unwrap(), LogFormat::Json);
    }
}

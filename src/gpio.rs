//! ==============================================================================
//! gpio.rs - dht11/dht22 temperature/humidity driver
//! ==============================================================================
//!
//! purpose:
//!     reads the dht sensor through a long-lived python helper process that
//!     owns the `adafruit_dht` device object for as long as the publisher runs.
//!
//! why subprocess to python?:
//!     dht sensors require precise bit-banging timing (~microseconds).
//!     pure rust in userspace is unreliable due to lack of real-time guarantees.
//!     adafruit_dht handles this correctly with timing compensation.
//!
//! helper protocol:
//!     rust -> helper:  one line per read request
//!     helper -> rust:  one json line per request
//!         {"t": 23.0, "h": 55.0}      values may be null on a bad frame
//!         {"error": "checksum ..."}   transient read failure
//!         {"fatal": "no module ..."}  helper cannot run at all
//!     closing stdin makes the helper call dht.exit() and quit.
//!
//! relationships:
//!     - implements: hal.rs (SensorDriver)
//!     - uses: python3/adafruit_dht
//!
//! ==============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::config::SensorModel;
use crate::domain::RawReading;
use crate::hal::{SensorDriver, SensorError};

/// a dht11 read takes ~250ms, retries inside the library can push it past 2s
const READ_TIMEOUT: Duration = Duration::from_secs(3);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// python side of the helper; `{class}` and `{pin}` are substituted
const HELPER_SCRIPT: &str = r#"
import sys, json
try:
    import adafruit_dht
    import board
    dht = adafruit_dht.{class}(getattr(board, "D{pin}"))
except Exception as e:
    print(json.dumps({"fatal": str(e)}), flush=True)
    sys.exit(1)

try:
    for _ in sys.stdin:
        try:
            print(json.dumps({"t": dht.temperature, "h": dht.humidity}), flush=True)
        except RuntimeError as e:
            print(json.dumps({"error": str(e)}), flush=True)
finally:
    dht.exit()
"#;

#[derive(Debug, Deserialize)]
struct HelperLine {
    t: Option<f64>,
    h: Option<f64>,
    error: Option<String>,
    fatal: Option<String>,
}

/// parse one helper reply
fn parse_line(line: &str) -> Result<RawReading, SensorError> {
    let reply: HelperLine = serde_json::from_str(line.trim())?;
    if let Some(fatal) = reply.fatal {
        return Err(SensorError::Unavailable(fatal));
    }
    if let Some(error) = reply.error {
        return Err(SensorError::ReadFailed(error));
    }
    Ok(RawReading {
        temperature: reply.t,
        humidity: reply.h,
    })
}

fn helper_script(model: SensorModel, pin: u8) -> String {
    let class = match model {
        SensorModel::Dht22 => "DHT22",
        _ => "DHT11",
    };
    HELPER_SCRIPT
        .replace("{class}", class)
        .replace("{pin}", &pin.to_string())
}

struct Helper {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Helper {
    fn spawn(script: &str) -> Result<Self, SensorError> {
        let mut child = Command::new("python3")
            .arg("-u")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SensorError::Unavailable("helper stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SensorError::Unavailable("helper stdout not captured".to_string()))?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn request(&mut self) -> Result<RawReading, SensorError> {
        self.stdin.write_all(b"read\n").await?;
        self.stdin.flush().await?;

        let line = tokio::time::timeout(READ_TIMEOUT, self.stdout.next_line())
            .await
            .map_err(|_| SensorError::Unavailable("helper did not answer in time".to_string()))??
            .ok_or_else(|| SensorError::Unavailable("helper exited".to_string()))?;

        parse_line(&line)
    }
}

/// dht sensor behind a python helper, spawned on first read
pub struct DhtSensor {
    script: String,
    pin: u8,
    helper: Option<Helper>,
}

impl DhtSensor {
    pub fn new(model: SensorModel, pin: u8) -> Self {
        Self {
            script: helper_script(model, pin),
            pin,
            helper: None,
        }
    }
}

#[async_trait]
impl SensorDriver for DhtSensor {
    async fn read(&mut self) -> Result<RawReading, SensorError> {
        if self.helper.is_none() {
            debug!("starting dht helper for pin {}", self.pin);
            self.helper = Some(Helper::spawn(&self.script)?);
        }
        let helper = self
            .helper
            .as_mut()
            .ok_or_else(|| SensorError::Unavailable("helper not running".to_string()))?;

        let result = helper.request().await;
        // anything but a sensor glitch means the helper is gone or out of sync
        if let Err(e) = &result {
            if !matches!(e, SensorError::ReadFailed(_)) {
                warn!("dropping dht helper: {}", e);
                self.helper = None;
            }
        }
        result
    }

    async fn release(&mut self) {
        let Some(helper) = self.helper.take() else {
            return;
        };
        let Helper { mut child, stdin, .. } = helper;

        // eof lets the helper run dht.exit()
        drop(stdin);
        match tokio::time::timeout(RELEASE_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!("dht helper exited: {}", status),
            Ok(Err(e)) => warn!("waiting for dht helper failed: {}", e),
            Err(_) => {
                warn!("dht helper did not exit, killing it");
                let _ = child.kill().await;
            }
        }
    }
}

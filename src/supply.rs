//! Programmable power supply driver
//!
//! Wraps an [`InstrumentLink`] with SCPI semantics for voltage/current
//! setpoints, output toggling and safety-range enforcement. The instrument,
//! not the driver, is authoritative for readback: `voltage()`/`current()`
//! query the device rather than returning the cached setpoint.

use crate::config::SupplyConfig;
use crate::error::{BenchError, Result};
use crate::link::InstrumentLink;
use crate::logging::StructuredLogger;

/// Driver for one programmable power supply
pub struct PowerSupply {
    /// Underlying instrument session
    link: InstrumentLink,

    /// Bench role of this supply ("upper" or "lower")
    name: String,

    /// Maximum accepted voltage setpoint in volts
    max_voltage: f64,

    /// Maximum accepted current setpoint in amperes
    max_current: f64,

    /// Observable output state; the supply starts with output off
    on: bool,

    /// Set once `shutdown` has run
    shut_down: bool,

    /// Logger
    logger: StructuredLogger,
}

impl PowerSupply {
    /// Connect to a supply and run its one-time initialization sequence:
    /// clear status, take remote control of the CC/CV/CP loops, zero both
    /// setpoints and program the power ceiling.
    pub async fn connect(name: &str, ip: &str, config: &SupplyConfig) -> Result<Self> {
        let logger = crate::logging::get_instrument_logger("supply", name);
        let link =
            InstrumentLink::connect(ip, config.port, config.buffer_size, config.timeout()).await?;

        let mut supply = Self {
            link,
            name: name.to_string(),
            max_voltage: config.limits.max_voltage,
            max_current: config.limits.max_current,
            on: false,
            shut_down: false,
            logger,
        };
        supply.initialize(config.limits.max_power).await?;
        supply.logger.info("Power supply initialized");
        Ok(supply)
    }

    async fn initialize(&mut self, max_power: f64) -> Result<()> {
        self.link.send("*CLS").await?;
        self.link.send("SYST:REM:CC eth").await?;
        self.link.send("SYST:REM:CV eth").await?;
        self.link.send("SYST:REM:CP eth").await?;
        self.link.send("SOUR:VOLT 0").await?;
        self.link.send("SOUR:CUR 0").await?;
        self.link.send(&format!("SOUR:POW {}", max_power)).await?;
        Ok(())
    }

    /// Command a voltage setpoint.
    ///
    /// Setpoints outside `[0, max_voltage]` are rejected without any command
    /// reaching the device.
    pub async fn set_voltage(&mut self, volts: f64) -> Result<()> {
        if !(0.0..=self.max_voltage).contains(&volts) {
            return Err(BenchError::range(
                "voltage".to_string(),
                format!("{} V outside 0..={} V", volts, self.max_voltage),
            ));
        }
        self.link.send(&format!("SOUR:VOLT {}", volts)).await
    }

    /// Command a current setpoint, subject to the same range policy.
    pub async fn set_current(&mut self, amps: f64) -> Result<()> {
        if !(0.0..=self.max_current).contains(&amps) {
            return Err(BenchError::range(
                "current".to_string(),
                format!("{} A outside 0..={} A", amps, self.max_current),
            ));
        }
        self.link.send(&format!("SOUR:CUR {}", amps)).await
    }

    /// Query the device-reported voltage setpoint
    pub async fn voltage(&mut self) -> Result<f64> {
        let reply = self.link.send_and_receive("SOUR:VOLT?").await?;
        parse_float_reply(&reply, "voltage")
    }

    /// Query the device-reported current setpoint
    pub async fn current(&mut self) -> Result<f64> {
        let reply = self.link.send_and_receive("SOUR:CUR?").await?;
        parse_float_reply(&reply, "current")
    }

    /// Observable output state
    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Bench role of this supply
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flip the output relay and return the new state
    pub async fn toggle_output(&mut self) -> Result<bool> {
        if self.on {
            self.link.send("OUTP 0").await?;
            self.on = false;
        } else {
            self.link.send("OUTP 1").await?;
            self.on = true;
        }
        self.logger
            .info(&format!("Output {}", if self.on { "on" } else { "off" }));
        Ok(self.on)
    }

    /// Zero both setpoints, hand control back to the front panel and close
    /// the link. Calling again after a successful or failed shutdown is a
    /// no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let result = self.release_sequence().await;
        self.link.close();
        self.logger.info("Power supply shut down");
        result
    }

    async fn release_sequence(&mut self) -> Result<()> {
        self.link.send("SOUR:VOLT 0").await?;
        self.link.send("SOUR:CUR 0").await?;
        self.link.send("SYST:REM:CC front").await?;
        self.link.send("SYST:REM:CV front").await?;
        self.link.send("SYST:REM:CP front").await?;
        Ok(())
    }
}

fn parse_float_reply(reply: &str, what: &str) -> Result<f64> {
    reply.trim().parse::<f64>().map_err(|e| {
        BenchError::protocol(format!("Bad {} reply {:?}: {}", what, reply, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_float_reply() {
        assert_eq!(parse_float_reply("12.5", "voltage").unwrap(), 12.5);
        assert_eq!(parse_float_reply(" 0 ", "current").unwrap(), 0.0);
        assert!(matches!(
            parse_float_reply("ERR", "voltage").unwrap_err(),
            BenchError::Protocol { .. }
        ));
    }
}

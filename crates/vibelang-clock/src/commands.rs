//! Host command messages.
//!
//! Each command is a name followed by float arguments, the way a patcher
//! message or a line typed into `vibe-clock` looks:
//!
//! ```text
//! locate 1500
//! loopframe 0 48000
//! freewheel 1
//! ```

use crate::error::{Error, Result};
use std::str::FromStr;

/// A command addressed to the bridge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Relocate to a position in milliseconds
    Locate(f64),
    /// Relocate to a position in frames
    LocateFrame(f64),
    /// Start the transport
    Start,
    /// Stop the transport
    Stop,
    /// Loop between two positions in milliseconds
    Loop { begin_ms: f64, end_ms: f64 },
    /// Loop between two positions in frames
    LoopFrame { begin: f64, end: f64 },
    /// Disable the loop
    Unloop,
    /// Freewheel on (non-zero) or off
    Freewheel(bool),
    /// Emit position, sample rate and state
    Poll,
}

impl Command {
    /// The message name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Locate(_) => "locate",
            Command::LocateFrame(_) => "locateframe",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Loop { .. } => "loop",
            Command::LoopFrame { .. } => "loopframe",
            Command::Unloop => "unloop",
            Command::Freewheel(_) => "freewheel",
            Command::Poll => "bang",
        }
    }
}

fn float_args<const N: usize>(name: &str, args: &[&str]) -> Result<[f64; N]> {
    if args.len() != N {
        return Err(Error::Parse(format!(
            "'{}' takes {} argument{}, got {}",
            name,
            N,
            if N == 1 { "" } else { "s" },
            args.len()
        )));
    }
    let mut values = [0.0; N];
    for (value, arg) in values.iter_mut().zip(args) {
        *value = arg
            .parse()
            .map_err(|_| Error::Parse(format!("'{}': '{}' is not a number", name, arg)))?;
    }
    Ok(values)
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let name = words.next().ok_or_else(|| Error::Parse("empty command".to_string()))?;
        let args: Vec<&str> = words.collect();

        let command = match name {
            "locate" => {
                let [ms] = float_args::<1>(name, &args)?;
                Command::Locate(ms)
            }
            "locateframe" => {
                let [frame] = float_args::<1>(name, &args)?;
                Command::LocateFrame(frame)
            }
            "start" => {
                float_args::<0>(name, &args)?;
                Command::Start
            }
            "stop" => {
                float_args::<0>(name, &args)?;
                Command::Stop
            }
            "loop" => {
                let [begin_ms, end_ms] = float_args::<2>(name, &args)?;
                Command::Loop { begin_ms, end_ms }
            }
            "loopframe" => {
                let [begin, end] = float_args::<2>(name, &args)?;
                Command::LoopFrame { begin, end }
            }
            "unloop" => {
                float_args::<0>(name, &args)?;
                Command::Unloop
            }
            "freewheel" => {
                let [onoff] = float_args::<1>(name, &args)?;
                Command::Freewheel(onoff != 0.0)
            }
            "bang" | "poll" => {
                float_args::<0>(name, &args)?;
                Command::Poll
            }
            other => return Err(Error::Parse(format!("unknown command '{}'", other))),
        };
        Ok(command)
    }
}

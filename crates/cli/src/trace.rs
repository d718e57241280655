//! Scroll trace format
//!
//! One step per line, `#` starts a comment:
//!
//! ```text
//! scroll 12      # scroll sample landing on page 12
//! jump 40        # viewport jump without a scroll sample
//! wait 150       # let 150 ms pass
//! zoom 2.0
//! rotate 90
//! request 7      # explicit fetch at visible priority
//! pressure       # memory pressure notification
//! ```

use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum TraceStep {
    Scroll(u32),
    Jump(u32),
    Wait(Duration),
    Zoom(f32),
    Rotate(i32),
    Request(u32),
    Pressure,
}

impl TraceStep {
    /// Page the viewport lands on, for steps that move it.
    pub fn landing_page(&self) -> Option<u32> {
        match self {
            TraceStep::Scroll(page) | TraceStep::Jump(page) => Some(*page),
            _ => None,
        }
    }
}

pub fn parse(source: &str) -> Result<Vec<TraceStep>> {
    let mut steps = Vec::new();
    for (index, line) in source.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let step = parse_line(line).with_context(|| format!("trace line {}: `{line}`", index + 1))?;
        steps.push(step);
    }
    Ok(steps)
}

fn parse_line(line: &str) -> Result<TraceStep> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let argument = words.next();
    if words.next().is_some() {
        bail!("too many arguments");
    }

    let required = || argument.context("missing argument");
    let step = match verb {
        "scroll" => TraceStep::Scroll(required()?.parse().context("invalid page")?),
        "jump" => TraceStep::Jump(required()?.parse().context("invalid page")?),
        "request" => TraceStep::Request(required()?.parse().context("invalid page")?),
        "wait" => TraceStep::Wait(Duration::from_millis(
            required()?.parse().context("invalid duration")?,
        )),
        "zoom" => TraceStep::Zoom(required()?.parse().context("invalid scale")?),
        "rotate" => TraceStep::Rotate(required()?.parse().context("invalid rotation")?),
        "pressure" => {
            if argument.is_some() {
                bail!("pressure takes no argument");
            }
            TraceStep::Pressure
        }
        other => bail!("unknown step `{other}`"),
    };
    Ok(step)
}

/// A steady scroll from `from` to `to`, one page every `interval`.
pub fn linear(from: u32, to: u32, interval: Duration) -> Vec<TraceStep> {
    let pages: Vec<u32> = if from <= to {
        (from..=to).collect()
    } else {
        (to..=from).rev().collect()
    };

    let mut steps = vec![TraceStep::Jump(from)];
    for page in pages.into_iter().skip(1) {
        steps.push(TraceStep::Wait(interval));
        steps.push(TraceStep::Scroll(page));
    }
    steps
}

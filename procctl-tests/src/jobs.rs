// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Jobs the integration tests run in worker processes.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use log::info;
use procctl::JobRegistry;
use serde_json::{json, Value};

fn number(value: &Value) -> anyhow::Result<f64> {
    value
        .as_f64()
        .with_context(|| format!("{value} is not a number"))
}

fn square(args: &[Value]) -> anyhow::Result<Value> {
    let x = args[0].as_i64().ok_or_else(|| anyhow!("{} is not an integer", args[0]))?;
    Ok(json!(x * x))
}

/// Logs through the `log` macros, which end up at the receiver.
fn divide(args: &[Value]) -> anyhow::Result<Value> {
    info!("Simulating a method with arguments and exceptions.");
    let (dividend, divisor) = (number(&args[0])?, number(&args[1])?);
    if divisor == 0.0 {
        bail!("division by zero");
    }
    let quotient = dividend / divisor;
    info!("Quotient is: {quotient}");
    Ok(json!(quotient))
}

fn invert(args: &[Value]) -> anyhow::Result<Value> {
    let x = number(&args[0])?;
    if x == 0.0 {
        bail!("0 has no inverse");
    }
    Ok(json!(1.0 / x))
}

fn always_true(_: &[Value]) -> anyhow::Result<Value> {
    info!("Simulating methods without arguments.");
    Ok(json!(true))
}

fn sleep_ms(args: &[Value]) -> anyhow::Result<Value> {
    let ms = args[0].as_u64().ok_or_else(|| anyhow!("{} is not a duration", args[0]))?;
    thread::sleep(Duration::from_millis(ms));
    Ok(json!(ms))
}

fn exit_abruptly(_: &[Value]) -> anyhow::Result<Value> {
    std::process::exit(7)
}

pub fn registry() -> JobRegistry {
    JobRegistry::new()
        .with("square", 1, square)
        .with("divide", 2, divide)
        .with("invert", 1, invert)
        .with("always_true", 0, always_true)
        .with("sleep_ms", 1, sleep_ms)
        .with("exit_abruptly", 0, exit_abruptly)
}
